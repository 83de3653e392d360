//! API error types and response handling.
//!
//! Every handler error becomes a JSON body with a machine-readable code.
//! The status codes are part of the reader contract: readers treat 401 as
//! "re-register" and 403 as "provisioning secret rejected".

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::state::RegistryError;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 401 Unauthorized - Missing, unknown or expired credential.
    Unauthorized {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 403 Forbidden - Credential or secret does not grant this operation.
    Forbidden {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "invalid_credential").
    pub error: String,

    /// Human-readable error message.
    pub message: String,
}

impl ApiError {
    /// A request without a usable bearer credential.
    #[must_use]
    pub fn missing_credential() -> Self {
        Self::Unauthorized {
            error_code: "missing_credential".to_string(),
            message: "Authorization: Bearer <token> required".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::BadRequest { error_code, message } => {
                (StatusCode::BAD_REQUEST, error_code, message)
            }
            Self::Unauthorized { error_code, message } => {
                (StatusCode::UNAUTHORIZED, error_code, message)
            }
            Self::Forbidden { error_code, message } => (StatusCode::FORBIDDEN, error_code, message),
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::Unauthorized { message, .. } => write!(f, "Unauthorized: {message}"),
            Self::Forbidden { message, .. } => write!(f, "Forbidden: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::SecretMismatch => Self::Forbidden {
                error_code: "secret_mismatch".to_string(),
                message: err.to_string(),
            },
            RegistryError::InvalidCredential => Self::Unauthorized {
                error_code: "invalid_credential".to_string(),
                message: err.to_string(),
            },
            RegistryError::DeviceMismatch { .. } => Self::Forbidden {
                error_code: "device_mismatch".to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_errors_map_to_contract_status() {
        let status = |err: RegistryError| ApiError::from(err).into_response().status();
        assert_eq!(status(RegistryError::SecretMismatch), StatusCode::FORBIDDEN);
        assert_eq!(status(RegistryError::InvalidCredential), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status(RegistryError::DeviceMismatch {
                expected: "a".into(),
                actual: "b".into()
            }),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::BadRequest {
            error_code: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        assert!(err.to_string().contains("Bad Request"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }
}
