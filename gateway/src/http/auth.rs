//! API-key middleware (spec §4.2 step 1, §6 Authentication): accepts `Authorization:
//! Bearer`, `Authorization: Basic` (password field), or `x-api-key`; strips those
//! headers before forwarding upstream.

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use std::sync::Arc;

use crate::dispatch::GatewayState;
use crate::error::GatewayError;

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }

    let auth = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.to_string());
    }
    if let Some(encoded) = auth.strip_prefix("Basic ") {
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (_, password) = text.split_once(':')?;
        return Some(password.to_string());
    }
    None
}

/// Rejects requests that do not present a configured API key. No-op (accepts everything)
/// when no key is configured, matching the teacher's permissive-by-default local setup.
pub async fn require_api_key(
    State(state): State<Arc<GatewayState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let configured = std::env::var("LLAMASWAP_API_KEY").ok();

    if let Some(expected) = configured {
        let presented = extract_key(request.headers());
        if presented.as_deref() != Some(expected.as_str()) {
            return Err(GatewayError::Authentication("missing or invalid API key".to_string()));
        }
    }

    let headers = request.headers_mut();
    headers.remove(axum::http::header::AUTHORIZATION);
    headers.remove("x-api-key");

    let _ = &state;
    Ok(next.run(request).await)
}
