//! Cache-or-compute report delivery

use chrono::Utc;
use common::error::{DatabaseError, DatabaseResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cache::{ReportCache, cache_key};
use crate::error::{ApiError, ApiResult};
use crate::models::{Period, ProsthesisStats, Report, ReportResponse, Schema, StoredReport};
use crate::repositories::{SubjectProfile, TelemetrySource, TypeTotals};

/// Bounded exponential backoff for reads against an unreachable source
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct ReportService {
    source: Arc<dyn TelemetrySource>,
    cache: Arc<dyn ReportCache>,
    ttl_days: i64,
    retry: RetryPolicy,
}

impl ReportService {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        cache: Arc<dyn ReportCache>,
        ttl_days: i64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            cache,
            ttl_days,
            retry,
        }
    }

    /// Serve the stored report for this request, or compute and store it.
    ///
    /// Concurrent misses for one key each compute and overwrite the object.
    pub async fn get_or_build(
        &self,
        schema: Schema,
        user_uuid: &str,
        period: &Period,
    ) -> ApiResult<ReportResponse> {
        let key = cache_key(schema, user_uuid, period);

        if let Some(stored) = self.cached(&key).await {
            debug!(key = %key, "Report served from cache");
            return Ok(ReportResponse {
                stored,
                cached: true,
            });
        }

        let report = self.build(schema, user_uuid, period).await?;
        let body = serde_json::to_vec(&StoredReport::new(report, Utc::now(), self.ttl_days))
            .map_err(|e| {
                error!("Failed to serialize report: {}", e);
                ApiError::Internal
            })?;

        // Responses are read back from the stored bytes so a miss and a later hit render identically.
        let stored: StoredReport = serde_json::from_slice(&body).map_err(|e| {
            error!("Failed to read back serialized report: {}", e);
            ApiError::Internal
        })?;

        match self.cache.put(&key, body).await {
            Ok(()) => info!(key = %key, "Report stored"),
            Err(e) => warn!(key = %key, error = %e, "Failed to store report"),
        }

        Ok(ReportResponse {
            stored,
            cached: false,
        })
    }

    /// A fresh stored report, if any. Store failures, stale or unreadable
    /// objects and empty reports count as misses; events for a new subject
    /// reach the aggregate source later than the subject's first request.
    async fn cached(&self, key: &str) -> Option<StoredReport> {
        let body = match self.cache.get(key).await {
            Ok(Some(body)) => body,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Report cache read failed, computing instead");
                return None;
            }
        };

        match serde_json::from_slice::<StoredReport>(&body) {
            Ok(stored) if stored.is_expired(Utc::now()) => {
                debug!(key = %key, expires_at = %stored.expires_at, "Stored report expired");
                None
            }
            Ok(stored) if stored.report.total_events == 0 => {
                debug!(key = %key, "Stored report has no events, recomputing");
                None
            }
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable stored report, computing instead");
                None
            }
        }
    }

    async fn build(&self, schema: Schema, user_uuid: &str, period: &Period) -> ApiResult<Report> {
        let profile = self
            .with_retry("profile lookup", || self.source.profile(schema, user_uuid))
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "User with UUID {} not found in schema {}",
                    user_uuid, schema
                ))
            })?;

        let totals = self
            .with_retry("event aggregation", || {
                self.source.totals_by_type(schema, user_uuid, period)
            })
            .await?;

        Ok(build_report(profile, totals))
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut read: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DatabaseResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match read().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_unavailable() && attempt < self.retry.attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.retry.attempts,
                        error = %e,
                        "Aggregate source unavailable during {}, retrying",
                        what
                    );
                    sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(source_failure(what, e)),
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        self.source.health_check().await.unwrap_or(false)
    }
}

fn source_failure(what: &str, error: DatabaseError) -> ApiError {
    error!("Aggregate source {} failed: {}", what, error);
    if error.is_unavailable() {
        ApiError::UpstreamUnavailable("Aggregate source unavailable".to_string())
    } else {
        ApiError::Internal
    }
}

/// Turn per-type sums into a report: means are sum / count, and types are
/// ordered by event count descending, then by name.
pub fn build_report(profile: SubjectProfile, totals: Vec<TypeTotals>) -> Report {
    let mut prosthesis_stats: Vec<ProsthesisStats> = totals
        .into_iter()
        .filter(|t| t.events_count > 0)
        .map(|t| {
            let count = t.events_count as f64;
            ProsthesisStats {
                avg_amplitude: t.amplitude_sum / count,
                avg_frequency: t.frequency_sum / count,
                prosthesis_type: t.prosthesis_type,
                events_count: t.events_count,
                total_duration: t.total_duration,
            }
        })
        .collect();

    prosthesis_stats.sort_by(|a, b| {
        b.events_count
            .cmp(&a.events_count)
            .then_with(|| a.prosthesis_type.cmp(&b.prosthesis_type))
    });

    Report {
        user_name: profile.name,
        user_email: profile.email,
        total_events: prosthesis_stats.iter().map(|s| s.events_count).sum(),
        total_duration: prosthesis_stats.iter().map(|s| s.total_duration).sum(),
        prosthesis_stats,
    }
}
