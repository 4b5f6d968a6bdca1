//! Conversation REST endpoint handlers.
//!
//! These complement the streaming completion endpoint with plain
//! request/response CRUD for conversations and their messages. Every
//! handler derives its owner scope from the caller identity header.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use parley::MessageRole;
use parley::error::StoreError;
use parley::store::{Conversation, NewMessage, StoredMessage};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::auth::require_user;
use crate::server::AppState;

fn store_error_response(e: StoreError) -> Response {
    let status = match &e {
        StoreError::NotFound(_) | StoreError::InvalidId(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

/// Conversation plus a preview of its most recent message, for list views.
#[derive(Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub preview: Option<String>,
}

/// GET /api/conversations — the caller's conversations, with previews.
pub async fn list_conversations(State(app): State<AppState>, headers: HeaderMap) -> Response {
    let owner_id = match require_user(&headers) {
        Ok(owner) => owner,
        Err(reject) => return reject.into_response(),
    };

    let conversations = match app.store.list_conversations(&owner_id).await {
        Ok(list) => list,
        Err(e) => return store_error_response(e),
    };

    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let preview = match app.store.latest(&owner_id, &conversation.id).await {
            Ok(latest) => latest.map(|m| m.content),
            Err(e) => return store_error_response(e),
        };
        summaries.push(ConversationSummary {
            conversation,
            preview,
        });
    }
    Json(summaries).into_response()
}

/// Request body for POST /api/conversations.
#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

/// POST /api/conversations — create a conversation for the caller.
pub async fn create_conversation(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationRequest>,
) -> Response {
    let owner_id = match require_user(&headers) {
        Ok(owner) => owner,
        Err(reject) => return reject.into_response(),
    };

    let title = body
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("New conversation");

    match app.store.create_conversation(&owner_id, title).await {
        Ok(conversation) => {
            debug!(conversation_id = %conversation.id, %owner_id, "conversation created");
            (StatusCode::CREATED, Json(conversation)).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

/// DELETE /api/conversations/{id} — remove a conversation and its messages.
pub async fn delete_conversation(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Response {
    let owner_id = match require_user(&headers) {
        Ok(owner) => owner,
        Err(reject) => return reject.into_response(),
    };

    match app.store.delete_conversation(&owner_id, &conversation_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error_response(e),
    }
}

/// GET /api/conversations/{id}/messages — full history, oldest first.
pub async fn list_messages(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Response {
    let owner_id = match require_user(&headers) {
        Ok(owner) => owner,
        Err(reject) => return reject.into_response(),
    };

    match app.store.history(&owner_id, &conversation_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => store_error_response(e),
    }
}

/// Request body for POST /api/conversations/{id}/messages.
#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub text: String,
}

/// POST /api/conversations/{id}/messages — append a user message.
///
/// The stored turn is what the next completion request builds its prompt
/// from.
pub async fn post_message(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Response {
    let owner_id = match require_user(&headers) {
        Ok(owner) => owner,
        Err(reject) => return reject.into_response(),
    };

    if body.text.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Text is required").into_response();
    }

    let id = Uuid::new_v4().to_string();
    let inserted: Result<StoredMessage, StoreError> = app
        .store
        .insert_message(NewMessage {
            id: &id,
            role: MessageRole::User,
            content: &body.text,
            owner_id: &owner_id,
            conversation_id: &conversation_id,
        })
        .await;

    match inserted {
        Ok(message) => (StatusCode::CREATED, Json(message)).into_response(),
        Err(e) => store_error_response(e),
    }
}
