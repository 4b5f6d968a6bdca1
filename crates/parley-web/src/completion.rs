//! The streaming completion endpoint.
//!
//! `GET /completion?conversationId=<id>` runs the full pipeline for the
//! caller's conversation and relays the reply as a server-sent event
//! stream. Pre-stream failures map to HTTP status codes; once the stream
//! is open, failures arrive in-band as a terminal `error` event.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use parley::error::{CompletionError, StoreError};
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::auth::require_user;
use crate::server::AppState;

/// Response body when no conversation id accompanies the request.
const NO_CONVERSATION_BODY: &str = "Invalid request. No Conversation provided.";

#[derive(Deserialize)]
pub struct CompletionParams {
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
}

/// GET /completion — run one completion and stream it back as SSE.
pub async fn get_completion(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CompletionParams>,
) -> Response {
    let owner_id = match require_user(&headers) {
        Ok(owner) => owner,
        Err(reject) => return reject.into_response(),
    };

    let conversation_id = params.conversation_id.unwrap_or_default();
    if conversation_id.trim().is_empty() {
        return (StatusCode::NOT_FOUND, NO_CONVERSATION_BODY).into_response();
    }

    debug!(%owner_id, %conversation_id, "completion requested");
    match app.pipeline.run(&owner_id, &conversation_id).await {
        Ok(frames) => sse_response(frames),
        Err(e) => {
            warn!(error = %e, %conversation_id, "completion rejected");
            (status_for(&e), e.to_string()).into_response()
        }
    }
}

/// Wrap a frame stream in an SSE response.
///
/// The headers are fixed: `text/event-stream`, no caching, and an explicit
/// keep-alive so proxies leave the long-lived connection open. The body is
/// produced frame by frame as the relay emits them.
fn sse_response(frames: parley::pipeline::FrameStream) -> Response {
    let body = Body::from_stream(frames.map(|frame| Ok::<_, Infallible>(frame.render())));

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// Map a pre-stream pipeline failure to an HTTP status.
fn status_for(error: &CompletionError) -> StatusCode {
    match error {
        CompletionError::BadRequest(_) => StatusCode::BAD_REQUEST,
        CompletionError::Transport(_) => StatusCode::BAD_GATEWAY,
        CompletionError::Store(StoreError::NotFound(_) | StoreError::InvalidId(_)) => {
            StatusCode::NOT_FOUND
        }
        CompletionError::Config(_) | CompletionError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_error_taxonomy() {
        assert_eq!(
            status_for(&CompletionError::BadRequest("empty".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CompletionError::Transport("refused".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&CompletionError::Store(StoreError::NotFound("c1".into()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CompletionError::Config("oversized".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
