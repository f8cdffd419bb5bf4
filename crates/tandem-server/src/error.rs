//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tandem_core::{LiveError, PollError};
use thiserror::Error;
use tracing::warn;

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request is malformed.
    #[error("{0}")]
    BadRequest(String),

    /// Request is not allowed.
    #[error("{0}")]
    Unauthorized(String),

    /// Request body is over the configured limit.
    #[error("{0}")]
    PayloadTooLarge(String),
}

impl From<PollError> for ApiError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::MissingRoom => ApiError::BadRequest("Missing room query parameter".into()),
        }
    }
}

impl From<LiveError> for ApiError {
    fn from(e: LiveError) -> Self {
        match e {
            LiveError::RoomMismatch { .. } => ApiError::Unauthorized("Room mismatch".into()),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        };
        warn!(status = %status, error = %self, "Request rejected");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
