//! HTTP-boundary authentication.
//!
//! Tokens arrive as `Authorization: Bearer <token>` or `X-API-Key: <token>`.
//! When authentication is enabled, unauthenticated requests are refused at
//! the HTTP layer with a 401 carrying a JSON-RPC error body; session-level
//! binding happens afterwards in the session service.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::json;

use relay_config::auth_from_token;
use relay_core::error::RouterError;

use crate::service::SharedState;

/// Extract the presented token from the request headers.
pub fn bearer_or_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

/// Middleware guarding the MCP endpoints. Passes everything through when
/// authentication is disabled.
pub async fn require_auth(
    State(shared): State<Arc<SharedState>>,
    request: Request,
    next: Next,
) -> Response {
    let cfg = shared.config.snapshot();
    if !cfg.auth.enabled() {
        return next.run(request).await;
    }

    let token = bearer_or_api_key(request.headers());
    match auth_from_token(&cfg, token.as_deref()) {
        Ok(_) => next.run(request).await,
        Err(error) => unauthorized_response(&error),
    }
}

/// 401 with the JSON-RPC error body shape clients expect.
pub fn unauthorized_response(error: &RouterError) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "error": { "code": error.code(), "message": error.to_string() },
        "id": null,
    });
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response must build")
}
