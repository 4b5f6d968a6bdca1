//! Caller identity extraction.
//!
//! Every route is scoped to one owner. The owner comes from the
//! `x-user-id` request header; there is no session or token layer here,
//! that belongs to whatever fronts this service.

use axum::http::{HeaderMap, StatusCode};

/// Header carrying the caller's identity.
pub const USER_HEADER: &str = "x-user-id";

/// Extract the caller identity, or reject the request with 401.
pub fn require_user(headers: &HeaderMap) -> Result<String, (StatusCode, &'static str)> {
    let value = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if value.is_empty() {
        return Err((StatusCode::UNAUTHORIZED, "Missing user identity"));
    }
    Ok(value.to_string())
}
