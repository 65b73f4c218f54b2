//! Application state shared across handlers

use common::jwt::TokenValidator;

use crate::{access::RolePolicy, service::ReportService};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub validator: TokenValidator,
    pub roles: RolePolicy,
    pub reports: ReportService,
    pub cors_origins: Vec<String>,
}
