//! Provider interaction layer.
//!
//! - [`streaming`]: the streaming chat-completion call. Parses the
//!   provider's newline-delimited `data:` framing into
//!   [`StreamEvent`](streaming::StreamEvent) values, skipping malformed
//!   sub-messages and terminating on the `[DONE]` literal.

pub mod streaming;

pub use streaming::{CompletionStream, StreamEvent};
