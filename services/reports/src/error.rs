//! Custom error types for the report service

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use common::jwt::TokenError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Custom error type for the report service
#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or invalid bearer token
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// Caller may not see the requested report
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No subject profile for the requested uuid
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Identity provider or aggregate source unreachable
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Internal server error")]
    Internal,
}

impl From<TokenError> for ApiError {
    fn from(error: TokenError) -> Self {
        if error.is_unavailable() {
            error!("Token validation could not reach the identity provider: {}", error);
            return ApiError::UpstreamUnavailable("Identity provider unavailable".to_string());
        }

        warn!("Bearer token rejected: {}", error);
        let detail = match error {
            TokenError::Expired => "Token expired",
            TokenError::UnknownKey(_) => "Token signature key not found",
            TokenError::UnauthorizedParty(_) => "Token not issued for this application",
            _ => "Invalid token",
        };
        ApiError::AuthenticationRequired(detail.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::AuthenticationRequired(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::UpstreamUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Type alias for API results
pub type ApiResult<T> = Result<T, ApiError>;
