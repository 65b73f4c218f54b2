//! Fixed registry of internal services and the forwarding client

use axum::body::Bytes;
use axum::http::{HeaderValue, StatusCode};
use reqwest::Url;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProxySettings;
use crate::models::{ProxyRequest, Upstream};
use crate::validation::validate_upstream_path;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Upstream {0} is not configured")]
    NotConfigured(Upstream),

    #[error("Invalid upstream path: {0}")]
    InvalidPath(String),

    #[error("Upstream unreachable: {0}")]
    Unreachable(String),
}

/// What came back from the upstream, passed to the browser as is
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// Base URLs of the services calls may be forwarded to
#[derive(Debug, Clone)]
pub struct UpstreamRegistry {
    bases: HashMap<Upstream, Url>,
    client: reqwest::Client,
}

impl UpstreamRegistry {
    pub fn new(bases: HashMap<Upstream, Url>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;
        Ok(Self { bases, client })
    }

    pub fn from_settings(settings: &ProxySettings) -> anyhow::Result<Self> {
        let mut bases = HashMap::new();
        for (upstream, raw) in [
            (Upstream::Reports, &settings.reports_url),
            (Upstream::Crm, &settings.crm_url),
            (Upstream::Telemetry, &settings.telemetry_url),
        ] {
            bases.insert(upstream, Url::parse(raw)?);
        }
        Ok(Self::new(
            bases,
            Duration::from_secs(settings.upstream_timeout_seconds),
        )?)
    }

    /// Resolve the target URL; the result always keeps the base's origin.
    pub fn resolve(&self, upstream: Upstream, path: &str) -> Result<Url, UpstreamError> {
        let base = self
            .bases
            .get(&upstream)
            .ok_or(UpstreamError::NotConfigured(upstream))?;

        validate_upstream_path(path).map_err(UpstreamError::InvalidPath)?;

        let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
        let url = Url::parse(&joined).map_err(|e| UpstreamError::InvalidPath(e.to_string()))?;

        if url.origin() != base.origin() {
            return Err(UpstreamError::InvalidPath(
                "Path changes the upstream origin".to_string(),
            ));
        }
        Ok(url)
    }

    /// Forward the call with the bearer token injected.
    ///
    /// Dropping the returned future aborts the upstream request.
    pub async fn forward(
        &self,
        request: &ProxyRequest,
        access_token: &str,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.resolve(request.upstream_id, request.path())?;
        debug!(upstream = %request.upstream_id, method = request.method.as_str(), path = url.path(), "Forwarding call");

        let mut outgoing = self
            .client
            .request(request.method.into(), url)
            .bearer_auth(access_token);
        if request.method.carries_body() {
            if let Some(body) = &request.body {
                outgoing = outgoing.json(body);
            }
        }

        let response = outgoing.send().await.map_err(|e| {
            warn!(upstream = %request.upstream_id, error = %e, "Upstream call failed");
            UpstreamError::Unreachable(e.to_string())
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .cloned();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Unreachable(e.to_string()))?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}
