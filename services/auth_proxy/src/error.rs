//! Custom error types for the session proxy

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::repositories::StoreError;
use crate::session::SessionError;

pub const ANOMALY_ADVISORY: &str = "The session id presented was already replaced by a newer one. \
The session has been closed because it may have been intercepted. Please sign in again.";

/// Errors surfaced by the proxy's HTTP handlers
#[derive(Error, Debug)]
pub enum ProxyError {
    /// No usable session; `redirect` asks for a redirect to `/sign_in` instead of 401
    #[error("Authentication required")]
    AuthenticationRequired { redirect: bool },

    /// A superseded session id was replayed
    #[error("Session anomaly detected")]
    SecurityAnomaly,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Internal server error")]
    Internal,
}

impl ProxyError {
    /// Map a session failure, honouring the caller's redirect preference.
    pub fn from_session(error: SessionError, redirect: bool) -> Self {
        match error {
            SessionError::Unauthenticated | SessionError::RefreshFailed => {
                ProxyError::AuthenticationRequired { redirect }
            }
            SessionError::Anomaly => ProxyError::SecurityAnomaly,
            SessionError::IdentityUnavailable(msg) => ProxyError::UpstreamUnavailable(msg),
            SessionError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ProxyError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Backend(e) => {
                error!("Session store unavailable: {}", e);
                ProxyError::UpstreamUnavailable("Session store unavailable".to_string())
            }
            StoreError::Corrupt(e) => {
                error!("Corrupt session data: {}", e);
                ProxyError::Internal
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ProxyError::AuthenticationRequired { redirect: true } => {
                return Redirect::to("/sign_in").into_response();
            }
            ProxyError::AuthenticationRequired { redirect: false } => {
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            ProxyError::SecurityAnomaly => (StatusCode::CONFLICT, ANOMALY_ADVISORY.to_string()),
            ProxyError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ProxyError::UpstreamUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ProxyError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ProxyError::AuthenticationRequired { redirect: false }
                .into_response()
                .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::AuthenticationRequired { redirect: true }
                .into_response()
                .status(),
            StatusCode::SEE_OTHER
        );
        assert_eq!(
            ProxyError::SecurityAnomaly.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProxyError::Validation("bad".to_string())
                .into_response()
                .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_anomaly_is_never_downgraded_by_redirect_preference() {
        assert!(matches!(
            ProxyError::from_session(SessionError::Anomaly, true),
            ProxyError::SecurityAnomaly
        ));
        assert!(matches!(
            ProxyError::from_session(SessionError::RefreshFailed, true),
            ProxyError::AuthenticationRequired { redirect: true }
        ));
    }
}
