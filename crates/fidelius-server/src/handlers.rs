use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{error::SecretError, AppState};

// ── IP extraction ────────────────────────────────────────────────────────────

/// Client key for rate limiting: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the peer address.
fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub ciphertext: String,
    pub nonce: String,
    /// Defaults to the retention period, which is also the upper bound.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    if !state.limiter.try_consume(&ip) {
        return SecretError::RateLimited.into_response();
    }

    let Ok(Json(body)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_json"})),
        )
            .into_response();
    };

    let ttl = match body.ttl_seconds {
        None => state.retention,
        Some(secs) if secs > 0 && Duration::from_secs(secs) <= state.retention => {
            Duration::from_secs(secs)
        }
        Some(_) => return SecretError::Validation("invalid_ttl").into_response(),
    };

    match state.store.create(&body.ciphertext, &body.nonce, ttl) {
        Ok(id) => {
            info!(ttl_seconds = ttl.as_secs(), "audit: secret.create");
            Json(CreateResponse { id }).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Get ───────────────────────────────────────────────────────────────────────

/// Hand out the secret and burn it. Every miss looks the same.
pub async fn get_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    if !state.limiter.try_consume(&ip) {
        return SecretError::RateLimited.into_response();
    }

    match state.store.consume(&id) {
        Ok(Some(secret)) => {
            info!("audit: secret.read");
            Json(secret).into_response()
        }
        Ok(None) => SecretError::NotFound.into_response(),
        Err(e) => e.into_response(),
    }
}
