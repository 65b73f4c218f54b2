//! Proxy settings, loaded from `AUTH_PROXY_*` environment variables

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Which session store backs the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    Redis,
    Memory,
}

/// Session proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,

    /// Keycloak base URL for server-to-server calls
    pub keycloak_url: String,
    /// Keycloak base URL the browser is redirected to
    pub keycloak_public_url: String,
    pub keycloak_realm: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Registered redirect URI of the `/callback` endpoint
    pub callback_url: String,

    pub frontend_public_url: String,
    /// Absolute URL prefixes a post-login redirect may point to
    pub allowed_redirects: Vec<String>,

    pub session_cookie_name: String,
    pub session_lifetime_seconds: u64,
    pub session_cookie_secure: bool,
    pub login_state_ttl_seconds: u64,
    pub session_store: SessionStoreKind,
    /// Base64 key (32 bytes) sealing tokens in the Redis store
    #[serde(default)]
    pub encryption_key: Option<String>,

    pub reports_url: String,
    pub crm_url: String,
    pub telemetry_url: String,
    pub upstream_timeout_seconds: u64,

    pub cors_origins: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            keycloak_url: "http://localhost:8080".to_string(),
            keycloak_public_url: "http://localhost:8080".to_string(),
            keycloak_realm: "reports-realm".to_string(),
            client_id: "auth-proxy".to_string(),
            client_secret: None,
            callback_url: "http://localhost:3000/callback".to_string(),
            frontend_public_url: "http://localhost:3000".to_string(),
            allowed_redirects: vec!["http://localhost:3000".to_string()],
            session_cookie_name: "session_id".to_string(),
            session_lifetime_seconds: 3600,
            session_cookie_secure: false,
            login_state_ttl_seconds: 300,
            session_store: SessionStoreKind::Redis,
            encryption_key: None,
            reports_url: "http://localhost:8001".to_string(),
            crm_url: "http://localhost:3001".to_string(),
            telemetry_url: "http://localhost:3002".to_string(),
            upstream_timeout_seconds: 30,
            cors_origins: Vec::new(),
        }
    }
}

impl ProxySettings {
    /// Defaults overlaid with `AUTH_PROXY_*` variables; list values are comma separated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&ProxySettings::default())?)
            .add_source(
                Environment::with_prefix("AUTH_PROXY")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_redirects")
                    .with_list_parse_key("cors_origins"),
            )
            .build()?
            .try_deserialize()
    }

    /// Realm URL under the given Keycloak base.
    pub fn realm_url(&self, base_url: &str) -> String {
        format!(
            "{}/realms/{}",
            base_url.trim_end_matches('/'),
            self.keycloak_realm
        )
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
