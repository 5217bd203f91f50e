use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors surfaced by the secret engine.
///
/// `NotFound` deliberately covers "never existed", "expired" and "already
/// consumed" alike so callers cannot tell which one happened.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("invalid payload: {0}")]
    Validation(&'static str),

    #[error("secret not found")]
    NotFound,

    #[error("rate limit exceeded")]
    RateLimited,

    /// I/O or transaction failure in the backend. Safe to retry.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl IntoResponse for SecretError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Validation(reason) => (StatusCode::BAD_REQUEST, *reason),
            Self::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limit"),
            Self::Storage(e) => {
                tracing::error!(error = %e, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        };
        (status, Json(json!({ "error": code }))).into_response()
    }
}
