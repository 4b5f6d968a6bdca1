//! HTTP surface for the parley completion pipeline.
//!
//! `parley-web` provides an axum server that exposes the streaming
//! completion endpoint plus a small REST API for conversation management.
//! Every route is scoped to the caller identified by the `x-user-id`
//! header; requests without one are rejected.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use parley::{OpenAiClient, store::FsStore, tokens::TokenCounter};
//! use parley_web::{WebConfig, spawn_web};
//!
//! let store = Arc::new(FsStore::new("./data")?);
//! let client = Arc::new(OpenAiClient::new(api_key, "gpt-3.5-turbo")?);
//! let counter = Arc::new(TokenCounter::new()?);
//!
//! let addr = spawn_web(store, client, counter, WebConfig::default()).await?;
//! println!("listening on http://{addr}");
//! ```
//!
//! # Endpoints
//!
//! - `GET /completion?conversationId=<id>` — SSE completion stream
//! - `GET /api/conversations` — list conversations with latest-message preview
//! - `POST /api/conversations` — create a conversation
//! - `DELETE /api/conversations/{id}` — delete a conversation and its messages
//! - `GET /api/conversations/{id}/messages` — full message history
//! - `POST /api/conversations/{id}/messages` — append a user message

mod api;
mod auth;
mod completion;
mod server;

pub use auth::USER_HEADER;
pub use server::{AppState, build_router, start_server};

use std::net::SocketAddr;
use std::sync::Arc;

use parley::OpenAiClient;
use parley::store::ConversationStore;
use parley::tokens::TokenCounter;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:3000`.
    pub bind_addr: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down.
pub async fn spawn_web(
    store: Arc<dyn ConversationStore>,
    client: Arc<OpenAiClient>,
    counter: Arc<TokenCounter>,
    config: WebConfig,
) -> std::io::Result<SocketAddr> {
    let router = build_router(store, client, counter);
    start_server(router, config.bind_addr).await
}
