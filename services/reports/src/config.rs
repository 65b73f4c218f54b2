//! Report service configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where generated reports are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    S3,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(CacheBackend::S3),
            "memory" => Ok(CacheBackend::Memory),
            other => Err(format!("Unknown cache backend: {}", other)),
        }
    }
}

/// Report service configuration
#[derive(Debug, Clone)]
pub struct ReportsConfig {
    pub host: String,
    pub port: u16,
    /// Identity provider URL reachable from this service
    pub keycloak_url: String,
    /// Browser-facing identity provider URL; tokens issued through it carry it as issuer
    pub keycloak_public_url: Option<String>,
    pub keycloak_realm: String,
    /// Accepted `azp` values; empty accepts any client of the realm
    pub allowed_azp: Vec<String>,
    pub admin_role: String,
    pub subject_role: String,
    pub cache_backend: CacheBackend,
    pub reports_bucket: String,
    /// Custom S3 endpoint (MinIO); addressing switches to path style when set
    pub s3_endpoint: Option<String>,
    /// Soft TTL written into every stored report
    pub report_ttl_days: i64,
    /// Attempts made against the aggregate source while it is unreachable
    pub aggregate_retry_attempts: u32,
    pub aggregate_retry_delay: Duration,
    pub cors_origins: Vec<String>,
}

impl ReportsConfig {
    /// Create a new ReportsConfig from environment variables
    ///
    /// # Environment Variables
    /// - `REPORTS_HOST` / `REPORTS_PORT`: bind address (default: 0.0.0.0:8001)
    /// - `KEYCLOAK_URL`, `KEYCLOAK_PUBLIC_URL`, `KEYCLOAK_REALM`: token issuer
    /// - `ALLOWED_AZP`: comma separated client ids
    /// - `ADMIN_ROLE` (default: administrators), `SUBJECT_ROLE` (default: prosthetic_users)
    /// - `REPORT_CACHE_BACKEND`: `s3` or `memory` (default: s3)
    /// - `REPORTS_BUCKET` (default: reports), `S3_ENDPOINT`
    /// - `REPORT_TTL_DAYS` (default: 7)
    /// - `AGGREGATE_RETRY_ATTEMPTS` (default: 3), `AGGREGATE_RETRY_DELAY_MS` (default: 200)
    /// - `CORS_ORIGINS`: comma separated origins
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: env::var("REPORTS_HOST").unwrap_or(defaults.host),
            port: parsed("REPORTS_PORT").unwrap_or(defaults.port),
            keycloak_url: env::var("KEYCLOAK_URL").unwrap_or(defaults.keycloak_url),
            keycloak_public_url: env::var("KEYCLOAK_PUBLIC_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            keycloak_realm: env::var("KEYCLOAK_REALM").unwrap_or(defaults.keycloak_realm),
            allowed_azp: list("ALLOWED_AZP").unwrap_or(defaults.allowed_azp),
            admin_role: env::var("ADMIN_ROLE").unwrap_or(defaults.admin_role),
            subject_role: env::var("SUBJECT_ROLE").unwrap_or(defaults.subject_role),
            cache_backend: parsed("REPORT_CACHE_BACKEND").unwrap_or(defaults.cache_backend),
            reports_bucket: env::var("REPORTS_BUCKET").unwrap_or(defaults.reports_bucket),
            s3_endpoint: env::var("S3_ENDPOINT").ok().filter(|url| !url.is_empty()),
            report_ttl_days: parsed::<i64>("REPORT_TTL_DAYS")
                .filter(|days| REPORT_TTL_DAYS_RANGE.contains(days))
                .unwrap_or(defaults.report_ttl_days),
            aggregate_retry_attempts: parsed::<u32>("AGGREGATE_RETRY_ATTEMPTS")
                .map(|attempts| attempts.max(1))
                .unwrap_or(defaults.aggregate_retry_attempts),
            aggregate_retry_delay: parsed("AGGREGATE_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.aggregate_retry_delay),
            cors_origins: list("CORS_ORIGINS").unwrap_or(defaults.cors_origins),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            keycloak_url: "http://localhost:8080".to_string(),
            keycloak_public_url: None,
            keycloak_realm: "reports-realm".to_string(),
            allowed_azp: Vec::new(),
            admin_role: "administrators".to_string(),
            subject_role: "prosthetic_users".to_string(),
            cache_backend: CacheBackend::S3,
            reports_bucket: "reports".to_string(),
            s3_endpoint: None,
            report_ttl_days: 7,
            aggregate_retry_attempts: 3,
            aggregate_retry_delay: Duration::from_millis(200),
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Accepted soft TTL of stored reports, in days
const REPORT_TTL_DAYS_RANGE: std::ops::RangeInclusive<i64> = 1..=3650;

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}
