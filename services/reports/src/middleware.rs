//! Bearer token authentication middleware

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use common::jwt::AccessClaims;
use tracing::debug;

use crate::{error::ApiError, state::AppState};

/// Authenticated caller, as read from a validated access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Federated external id when present, else the token subject
    pub subject_uuid: String,
    pub username: Option<String>,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl From<AccessClaims> for AuthUser {
    fn from(claims: AccessClaims) -> Self {
        Self {
            subject_uuid: claims.subject_uuid().to_string(),
            roles: claims.roles(),
            username: claims.preferred_username,
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| ApiError::AuthenticationRequired("Missing Bearer token".to_string()))?;

    let claims = state.validator.validate(token).await?;
    if claims.sub.is_empty() {
        return Err(ApiError::AuthenticationRequired(
            "Token carries no subject".to_string(),
        ));
    }

    let user = AuthUser::from(claims);
    debug!(subject = %user.subject_uuid, roles = ?user.roles, "Authenticated caller");

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
