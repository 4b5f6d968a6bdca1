//! Axum server setup and router construction.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get};
use parley::OpenAiClient;
use parley::pipeline::CompletionPipeline;
use parley::store::ConversationStore;
use parley::tokens::TokenCounter;
use tower_http::cors::{Any, CorsLayer};

use crate::{api, completion};

/// Shared application state passed to all handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub pipeline: Arc<CompletionPipeline>,
}

/// Build the full axum router.
///
/// The router serves:
/// - SSE completion stream at `/completion`
/// - Conversation REST API at `/api/conversations*`
pub fn build_router(
    store: Arc<dyn ConversationStore>,
    client: Arc<OpenAiClient>,
    counter: Arc<TokenCounter>,
) -> Router {
    let pipeline = Arc::new(CompletionPipeline::new(
        Arc::clone(&store),
        client,
        counter,
    ));
    let state = AppState { store, pipeline };

    // CORS layer for development (frontend dev server on a different port).
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/completion", get(completion::get_completion))
        .route(
            "/api/conversations",
            get(api::list_conversations).post(api::create_conversation),
        )
        .route(
            "/api/conversations/{id}",
            delete(api::delete_conversation),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(api::list_messages).post(api::post_message),
        )
        .with_state(state)
        .layer(cors)
}

/// Start the axum server and return the bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server exited");
        }
    });

    Ok(addr)
}
