//! Error taxonomy for the completion pipeline.
//!
//! Four terminal classes plus one non-fatal one:
//!
//! - [`CompletionError::Config`]: inconsistent budget constants or a prompt
//!   that cannot fit. Fails the request before any provider call.
//! - [`CompletionError::BadRequest`]: missing or invalid caller input. No
//!   provider call, no retry.
//! - [`CompletionError::Transport`]: provider unreachable or broken
//!   mid-stream. Surfaced to the caller as a terminal error event.
//! - [`CompletionError::Store`]: the conversation store failed. Logged and
//!   reported, never retried by the pipeline.
//! - [`FramingError`]: one malformed provider chunk. Not a
//!   `CompletionError` variant on purpose: the decoder logs it and the
//!   stream continues.
//!
//! Client disconnects are not errors at all; teardown is clean and
//! idempotent. Retry policy, if any, belongs to the caller.

use thiserror::Error;

/// Terminal failure of one completion request.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// Budget constants inconsistent, or the prompt cannot fit the budget.
    #[error("budget configuration invalid: {0}")]
    Config(String),

    /// Missing or invalid caller input.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// Provider unreachable, or the stream broke before the terminator.
    #[error("provider transport failure: {0}")]
    Transport(String),

    /// The conversation store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure inside the conversation/message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("store record corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    /// No such conversation or message within the caller's scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// An identifier that could escape its owner's scope.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

/// One unparseable provider sub-message. Logged and skipped; never
/// terminates or fails the stream.
#[derive(Debug, Error)]
#[error("unparseable provider chunk ({reason}): {payload}")]
pub struct FramingError {
    pub reason: String,
    pub payload: String,
}
