//! Proxy call payloads

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Internal services the proxy may forward to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Upstream {
    Reports,
    Crm,
    Telemetry,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::Reports => "reports",
            Upstream::Crm => "crm",
            Upstream::Telemetry => "telemetry",
        }
    }

    /// Path used when the caller does not name one
    pub fn default_path(&self) -> &'static str {
        match self {
            Upstream::Reports => "/reports",
            Upstream::Crm | Upstream::Telemetry => "/",
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP methods that may be forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum UpstreamMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl UpstreamMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamMethod::Get => "GET",
            UpstreamMethod::Post => "POST",
            UpstreamMethod::Put => "PUT",
            UpstreamMethod::Patch => "PATCH",
            UpstreamMethod::Delete => "DELETE",
        }
    }

    pub fn carries_body(&self) -> bool {
        matches!(
            self,
            UpstreamMethod::Post | UpstreamMethod::Put | UpstreamMethod::Patch
        )
    }
}

impl FromStr for UpstreamMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(UpstreamMethod::Get),
            "POST" => Ok(UpstreamMethod::Post),
            "PUT" => Ok(UpstreamMethod::Put),
            "PATCH" => Ok(UpstreamMethod::Patch),
            "DELETE" => Ok(UpstreamMethod::Delete),
            other => Err(format!("Unsupported method: {}", other)),
        }
    }
}

impl TryFrom<String> for UpstreamMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UpstreamMethod> for String {
    fn from(method: UpstreamMethod) -> Self {
        method.as_str().to_string()
    }
}

impl From<UpstreamMethod> for reqwest::Method {
    fn from(method: UpstreamMethod) -> Self {
        match method {
            UpstreamMethod::Get => reqwest::Method::GET,
            UpstreamMethod::Post => reqwest::Method::POST,
            UpstreamMethod::Put => reqwest::Method::PUT,
            UpstreamMethod::Patch => reqwest::Method::PATCH,
            UpstreamMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A call the browser asks the proxy to make on its behalf
///
/// Arrives as query parameters on `GET /proxy` and as a JSON body on `POST /proxy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub upstream_id: Upstream,
    #[serde(default)]
    pub method: UpstreamMethod,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub redirect_to_sign_in: bool,
}

impl ProxyRequest {
    pub fn path(&self) -> &str {
        self.path
            .as_deref()
            .unwrap_or_else(|| self.upstream_id.default_path())
    }
}
