//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use talkmeter_core::{ErrorKind, MeterError};

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Forbidden - valid credentials but insufficient permissions.
    #[error("forbidden")]
    Forbidden,

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An engine operation was refused or failed.
    #[error(transparent)]
    Meter(#[from] MeterError),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

fn meter_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
        ErrorKind::InvalidState | ErrorKind::Orphaned => StatusCode::CONFLICT,
        ErrorKind::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::Locked => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                self.to_string(),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden", self.to_string(), None),
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidInput.as_str(),
                msg.clone(),
                None,
            ),
            Self::Meter(err) => {
                let kind = err.kind();
                let details = match err {
                    MeterError::InsufficientFunds { balance, required } => {
                        Some(serde_json::json!({
                            "balance": balance,
                            "required": required
                        }))
                    }
                    _ => None,
                };
                let message = if kind == ErrorKind::Internal {
                    tracing::error!(error = %err, "Internal server error");
                    "An internal error occurred".to_string()
                } else {
                    err.to_string()
                };
                (meter_status(kind), kind.as_str(), message, details)
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<talkmeter_store::StoreError> for ApiError {
    fn from(err: talkmeter_store::StoreError) -> Self {
        Self::Meter(err.into())
    }
}
