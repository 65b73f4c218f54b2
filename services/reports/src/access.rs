//! Who may read whose report

use crate::error::ApiError;
use crate::middleware::AuthUser;

/// Realm roles that grant access to reports
#[derive(Debug, Clone)]
pub struct RolePolicy {
    /// May read any subject's report
    pub admin_role: String,
    /// May read only their own report
    pub subject_role: String,
}

impl Default for RolePolicy {
    fn default() -> Self {
        Self {
            admin_role: "administrators".to_string(),
            subject_role: "prosthetic_users".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// Caller holds neither report role
    NoReportRole,
    /// Caller asked for someone else's report without the admin role
    OtherSubject,
}

impl From<Denial> for ApiError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::NoReportRole => {
                ApiError::Forbidden("You are not allowed to view reports".to_string())
            }
            Denial::OtherSubject => ApiError::Forbidden(
                "You are not allowed to view another user's report".to_string(),
            ),
        }
    }
}

/// Resolve the subject whose report is read, or deny.
///
/// An absent `requested` uuid means the caller's own report.
pub fn authorize<'a>(
    requested: Option<&'a str>,
    caller: &'a AuthUser,
    policy: &RolePolicy,
) -> Result<&'a str, Denial> {
    let is_admin = caller.has_role(&policy.admin_role);
    if !is_admin && !caller.has_role(&policy.subject_role) {
        return Err(Denial::NoReportRole);
    }

    match requested {
        None => Ok(&caller.subject_uuid),
        Some(uuid) if uuid == caller.subject_uuid || is_admin => Ok(uuid),
        Some(_) => Err(Denial::OtherSubject),
    }
}
