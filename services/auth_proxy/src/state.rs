//! Application state shared across handlers

use std::sync::Arc;

use crate::{config::ProxySettings, session::SessionManager, upstream::UpstreamRegistry};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ProxySettings>,
    pub sessions: SessionManager,
    pub upstreams: UpstreamRegistry,
}
