//! XRPC error types and response formatting.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Handler result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// API error type that converts to XRPC error responses.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Invalid request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The requested feed is not served here.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal server error (database, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<lightbox_core::Error> for ApiError {
    fn from(err: lightbox_core::Error) -> Self {
        match err {
            lightbox_core::Error::InvalidCursor(cursor) => {
                Self::InvalidRequest(format!("malformed cursor: '{cursor}'"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, "InvalidRequest", msg),
            Self::UnsupportedAlgorithm(msg) => {
                (StatusCode::BAD_REQUEST, "UnsupportedAlgorithm", msg)
            }
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound", msg),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalServerError",
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}
