//! Identity projection returned by `/user_info`

use common::jwt::AccessClaims;
use serde::{Deserialize, Serialize};

/// What the browser is told about the signed-in subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub has_session_cookie: bool,
    pub is_authorized: bool,
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub realm_roles: Option<Vec<String>>,
    pub permissions: Option<serde_json::Value>,
    pub sub: Option<String>,
    pub external_uuid: Option<String>,
}

impl UserInfo {
    /// No usable session behind the request.
    pub fn anonymous(has_session_cookie: bool) -> Self {
        Self {
            has_session_cookie,
            is_authorized: false,
            username: None,
            email: None,
            first_name: None,
            last_name: None,
            realm_roles: None,
            permissions: None,
            sub: None,
            external_uuid: None,
        }
    }

    pub fn from_claims(claims: &AccessClaims) -> Self {
        Self {
            has_session_cookie: true,
            is_authorized: true,
            username: claims.preferred_username.clone(),
            email: claims.email.clone(),
            first_name: claims.given_name.clone(),
            last_name: claims.family_name.clone(),
            realm_roles: Some(claims.roles()),
            permissions: claims.resource_access.clone(),
            sub: Some(claims.sub.clone()),
            external_uuid: claims.external_uuid.clone(),
        }
    }
}
