//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hydrosnap_core::HydroSnapError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to a specific HTTP status code and produces a
/// consistent JSON error response.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 403 Forbidden - Understood but refused (permission, geofence).
    Forbidden {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Resource does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Operation cannot be completed due to current state.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 422 Unprocessable Entity - Well-formed input with unusable content.
    Unprocessable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details (not exposed to client in production).
        details: Option<String>,
    },

    /// 503 Service Unavailable - The location provider could not deliver a fix.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// HTTP status to use (502, 503 or 504).
        status: u16,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "LOCATION_PERMISSION_DENIED",
    "message": "Location permission denied",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "OUT_OF_RANGE").
    #[schema(example = "LOCATION_PERMISSION_DENIED")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Location permission denied")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Shorthand for a 400 with the given code and message.
    pub fn bad_request(error_code: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let plain = |error: String, message: String| ErrorResponse {
            error,
            message,
            details: None,
        };

        let (status, error_response) = match self {
            Self::BadRequest { error_code, message } => {
                (StatusCode::BAD_REQUEST, plain(error_code, message))
            }
            Self::Forbidden { error_code, message } => {
                (StatusCode::FORBIDDEN, plain(error_code, message))
            }
            Self::NotFound { error_code, message } => {
                (StatusCode::NOT_FOUND, plain(error_code, message))
            }
            Self::Conflict { error_code, message } => {
                (StatusCode::CONFLICT, plain(error_code, message))
            }
            Self::Unprocessable { error_code, message } => {
                (StatusCode::UNPROCESSABLE_ENTITY, plain(error_code, message))
            }

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                // Log internal errors
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );

                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: error_code,
                        message,
                        details: details.map(|d| serde_json::json!(d)),
                    },
                )
            }

            Self::ServiceUnavailable {
                error_code,
                message,
                status,
            } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
                plain(error_code, message),
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::Forbidden { message, .. } => write!(f, "Forbidden: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::Unprocessable { message, .. } => write!(f, "Unprocessable: {message}"),
            Self::InternalError { message, .. } => {
                write!(f, "Internal Error: {message}")
            }
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from hydrosnap_core errors.
impl From<HydroSnapError> for ApiError {
    fn from(err: HydroSnapError) -> Self {
        let error_code = err.error_code().to_string();
        let message = err.to_string();

        match err.http_status_code() {
            400 => Self::BadRequest { error_code, message },
            403 => Self::Forbidden { error_code, message },
            404 => Self::NotFound { error_code, message },
            409 => Self::Conflict { error_code, message },
            422 => Self::Unprocessable { error_code, message },
            status @ 502..=504 => Self::ServiceUnavailable {
                error_code,
                message,
                status,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<hydrosnap_core::LocationError> for ApiError {
    fn from(err: hydrosnap_core::LocationError) -> Self {
        Self::from(HydroSnapError::from(err))
    }
}

impl From<hydrosnap_core::StartError> for ApiError {
    fn from(err: hydrosnap_core::StartError) -> Self {
        Self::from(HydroSnapError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrosnap_core::{LocationError, PermissionStatus, StartError};

    #[test]
    fn test_bad_request_error() {
        let err = ApiError::bad_request("test_error", "Test message");
        assert!(err.to_string().contains("Bad Request"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }

    #[test]
    fn test_core_error_mapping() {
        let status = |err: ApiError| err.into_response().status();

        assert_eq!(
            status(LocationError::PermissionDenied.into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(LocationError::Timeout { timeout_ms: 15_000 }.into()),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status(
                StartError::AlreadyActive {
                    site_id: "CWC-DEL-001".into()
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(StartError::PermissionUnavailable(PermissionStatus::Denied).into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(HydroSnapError::NoActiveSession.into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(HydroSnapError::PersistenceError("disk".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
