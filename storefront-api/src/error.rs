/// Error handling for the API server
///
/// This module provides a unified error type that maps to HTTP responses.
/// All handlers should return `Result<T, ApiError>` which automatically
/// converts to appropriate HTTP status codes.
///
/// Database errors are translated here, not in the database core:
///
/// | Error | Status |
/// |---|---|
/// | pool timeout, pool closed, not initialized | 503 |
/// | unique violation | 409 |
/// | no rows | 404 |
/// | anything else | 500 |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use storefront_shared::db::error::{DbError, DecodeError};
use storefront_shared::models::cart::CartError;

/// API result type alias
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),

    /// Not found (404)
    NotFound(String),

    /// Conflict (409) - e.g., duplicate email
    Conflict(String),

    /// Internal server error (500)
    InternalError(String),

    /// Service unavailable (503)
    ServiceUnavailable(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "bad_request", "conflict")
    pub error: String,

    /// Human-readable error message
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not found: {}", msg),
            ApiError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            ApiError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_code, message) = match self {
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::NotFound(msg) => ("not_found", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::InternalError(msg) => {
                // Log internal errors but don't expose details to clients
                tracing::error!("Internal error: {}", msg);
                ("internal_error", "An internal error occurred".to_string())
            }
            ApiError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Convert database errors to API errors
impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::PoolTimeout { .. } => {
                ApiError::ServiceUnavailable("Database is busy, retry later".to_string())
            }
            DbError::PoolClosed | DbError::NotInitialized => {
                ApiError::ServiceUnavailable("Database is unavailable".to_string())
            }
            DbError::Decode(DecodeError::NoRows) => {
                ApiError::NotFound("Resource not found".to_string())
            }
            ref unique if unique.is_unique_violation() => match unique.constraint() {
                Some(constraint) if constraint.contains("email") => {
                    ApiError::Conflict("Email already exists".to_string())
                }
                Some(constraint) => {
                    ApiError::Conflict(format!("Constraint violation: {}", constraint))
                }
                None => ApiError::Conflict("Resource already exists".to_string()),
            },
            other => ApiError::InternalError(format!("Database error: {}", other)),
        }
    }
}

/// Convert cart errors to API errors
impl From<CartError> for ApiError {
    fn from(err: CartError) -> Self {
        match err {
            CartError::InvalidQuantity(_) => ApiError::BadRequest(err.to_string()),
            CartError::ProductNotFound(_) => ApiError::NotFound(err.to_string()),
            CartError::InsufficientStock { .. } => ApiError::Conflict(err.to_string()),
            CartError::Database(db) => db.into(),
        }
    }
}
