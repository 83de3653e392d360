//! Bearer credential extraction.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use crate::api::error::{ApiError, ApiResult};

/// The token from an `Authorization: Bearer <token>` header.
///
/// # Errors
///
/// Returns 401 if the header is missing or not a bearer credential.
pub fn bearer(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(ApiError::missing_credential)
}
