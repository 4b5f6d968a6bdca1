//! Streaming chat-completion pipeline for a conversational assistant.
//!
//! `parley` is the backend core of a multi-conversation assistant: stored
//! turns are reassembled into a prompt under a hard token budget, the model
//! provider is invoked in streaming mode, incremental output is relayed to
//! the client as server-sent events, and the finished reply is persisted
//! exactly once. The HTTP surface lives in the `parley-web` crate.
//!
//! # Where to find things
//!
//! If you're looking for how to...
//!
//! - **Count tokens:** see [`TokenCounter`](tokens::TokenCounter). Counts use
//!   the `cl100k_base` scheme so they match provider-side limits exactly,
//!   including the per-message framing overhead.
//!
//! - **Build a prompt under budget:** see
//!   [`PromptBudgeter`](prompt::PromptBudgeter). History is selected
//!   newest-first until the prompt budget is exhausted; the synthesized
//!   system instruction always comes first.
//!
//! - **Stream from the provider:** see [`OpenAiClient::stream`] in
//!   [`api::streaming`]. Yields a lazy sequence of
//!   [`StreamEvent`](api::streaming::StreamEvent) values terminated by the
//!   `[DONE]` sentinel; malformed chunks are logged and skipped.
//!
//! - **Run a whole request:** see
//!   [`CompletionPipeline`](pipeline::CompletionPipeline). One task per
//!   request relays fragments in order, accumulates the reply, and writes a
//!   single `assistant` message on the terminal sentinel.
//!
//! - **Persist conversations:** see the
//!   [`ConversationStore`](store::ConversationStore) trait, with
//!   [`FsStore`](store::FsStore) (JSON directories, atomic writes) and
//!   [`MemoryStore`](store::MemoryStore) implementations. Every operation is
//!   scoped by owner identity.
//!
//! # Design principles
//!
//! 1. **Request-scoped state.** Accumulators, reply identifiers, and budgets
//!    live inside one pipeline task per request. Nothing about an in-flight
//!    completion is shared across requests.
//!
//! 2. **The context window is a hard budget.** Prompt assembly never guesses:
//!    token counts are exact, the newest turns win, and a prompt that cannot
//!    fit fails before the provider is contacted.
//!
//! 3. **Streams are append-only.** Fragments are relayed and accumulated in
//!    provider-emission order, with no reordering and no buffering beyond the
//!    transport's own.
//!
//! 4. **Partial failure is survivable.** A garbled provider chunk is skipped,
//!    a disconnected client tears down cleanly, and nothing is persisted
//!    unless the terminal sentinel arrived.

pub mod api;
pub mod error;
pub mod pipeline;
pub mod prompt;
pub mod store;
pub mod tokens;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CompletionError;

// ── Constants ──────────────────────────────────────────────────────

/// Default base URL for the chat completions API.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model for completions.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in a conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One message of an assembled prompt. Ephemeral: exists only for the
/// duration of a single completion request, never persisted.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PromptMessage {
    pub role: MessageRole,
    /// Identity tag attached to history messages (the owner's id).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            name: None,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            name: None,
            content: content.into(),
        }
    }

    /// A history message tagged with the owner's identity.
    pub fn tagged(role: MessageRole, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role,
            name: Some(name.into()),
            content: content.into(),
        }
    }
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Temperature is always serialized: this
/// pipeline pins it to 0 for reproducibility, which must reach the wire.
#[derive(Serialize, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the chat completions API.
///
/// Streaming lives in [`api::streaming`]: [`OpenAiClient::stream`] yields
/// incremental deltas terminated by the `[DONE]` sentinel.
pub struct OpenAiClient {
    pub(crate) client: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) base_url: String,
    pub(crate) model: String,
}

impl OpenAiClient {
    /// Create a new client with the given API key and model.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .user_agent("parley/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CompletionError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
        })
    }

    /// Point the client at a different API base URL (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// The model identifier sent with every request.
    pub fn model(&self) -> &str {
        &self.model
    }
}
