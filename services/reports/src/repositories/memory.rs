//! In-process aggregate source for local runs and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::{DatabaseError, DatabaseResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::{SubjectProfile, TelemetrySource, TypeTotals};
use crate::models::{Period, Schema};

/// One ingested telemetry event
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub user_uuid: String,
    pub prosthesis_type: String,
    pub signal_duration: i64,
    pub signal_amplitude: f64,
    pub signal_frequency: f64,
    pub created_ts: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryTelemetrySource {
    profiles: RwLock<HashMap<(Schema, String), SubjectProfile>>,
    events: RwLock<Vec<(Schema, TelemetryEvent)>>,
    /// Remaining reads that fail as if the source were unreachable
    outages: AtomicU32,
    reads: AtomicU32,
}

impl MemoryTelemetrySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_profile(&self, schema: Schema, user_uuid: &str, name: &str, email: &str) {
        self.profiles.write().await.insert(
            (schema, user_uuid.to_string()),
            SubjectProfile {
                name: name.to_string(),
                email: email.to_string(),
            },
        );
    }

    pub async fn add_event(&self, schema: Schema, event: TelemetryEvent) {
        self.events.write().await.push((schema, event));
    }

    /// Fail the next `count` reads with a connection error.
    pub fn fail_next_reads(&self, count: u32) {
        self.outages.store(count, Ordering::SeqCst);
    }

    /// Number of reads attempted so far
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> DatabaseResult<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if outage {
            return Err(DatabaseError::Connection(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySource for MemoryTelemetrySource {
    async fn profile(
        &self,
        schema: Schema,
        user_uuid: &str,
    ) -> DatabaseResult<Option<SubjectProfile>> {
        self.check_available()?;
        Ok(self
            .profiles
            .read()
            .await
            .get(&(schema, user_uuid.to_string()))
            .cloned())
    }

    async fn totals_by_type(
        &self,
        schema: Schema,
        user_uuid: &str,
        period: &Period,
    ) -> DatabaseResult<Vec<TypeTotals>> {
        self.check_available()?;

        let events = self.events.read().await;
        let mut grouped: BTreeMap<&str, TypeTotals> = BTreeMap::new();
        for (_, event) in events.iter().filter(|(event_schema, event)| {
            *event_schema == schema
                && event.user_uuid == user_uuid
                && period.contains(event.created_ts)
        }) {
            let totals = grouped
                .entry(event.prosthesis_type.as_str())
                .or_insert_with(|| TypeTotals {
                    prosthesis_type: event.prosthesis_type.clone(),
                    events_count: 0,
                    total_duration: 0,
                    amplitude_sum: 0.0,
                    frequency_sum: 0.0,
                });
            totals.events_count += 1;
            totals.total_duration += event.signal_duration;
            totals.amplitude_sum += event.signal_amplitude;
            totals.frequency_sum += event.signal_frequency;
        }

        Ok(grouped.into_values().collect())
    }

    async fn health_check(&self) -> DatabaseResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(user: &str, kind: &str, day: u32) -> TelemetryEvent {
        TelemetryEvent {
            user_uuid: user.to_string(),
            prosthesis_type: kind.to_string(),
            signal_duration: 100,
            signal_amplitude: 1.5,
            signal_frequency: 40.0,
            created_ts: Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_totals_group_by_type_within_period() {
        let source = MemoryTelemetrySource::new();
        source.add_event(Schema::Default, event("a", "hand", 1)).await;
        source.add_event(Schema::Default, event("a", "hand", 2)).await;
        source.add_event(Schema::Default, event("a", "leg", 3)).await;
        source.add_event(Schema::Default, event("b", "hand", 2)).await;
        source.add_event(Schema::Debezium, event("a", "hand", 2)).await;

        let all = source
            .totals_by_type(Schema::Default, "a", &Period::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].prosthesis_type, "hand");
        assert_eq!(all[0].events_count, 2);
        assert_eq!(all[0].total_duration, 200);

        let period = Period {
            start: Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap()),
        };
        let bounded = source
            .totals_by_type(Schema::Default, "a", &period)
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].events_count, 1);
    }

    #[tokio::test]
    async fn test_scripted_outage() {
        let source = MemoryTelemetrySource::new();
        source.fail_next_reads(1);

        let err = source.profile(Schema::Default, "a").await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(source.profile(Schema::Default, "a").await.unwrap(), None);
        assert_eq!(source.reads(), 2);
    }
}
