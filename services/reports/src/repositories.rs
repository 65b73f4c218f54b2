//! Read access to the aggregate source

use async_trait::async_trait;
use common::error::DatabaseResult;

use crate::models::{Period, Schema};

#[cfg(test)]
pub mod memory;
pub mod telemetry;

#[cfg(test)]
pub use memory::{MemoryTelemetrySource, TelemetryEvent};
pub use telemetry::PgTelemetrySource;

/// Name and contact of the subject a report is about
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectProfile {
    pub name: String,
    pub email: String,
}

/// Event sums for one prosthesis type
#[derive(Debug, Clone, PartialEq)]
pub struct TypeTotals {
    pub prosthesis_type: String,
    pub events_count: i64,
    pub total_duration: i64,
    pub amplitude_sum: f64,
    pub frequency_sum: f64,
}

/// Eventually consistent, read-only source of subject profiles and event sums
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn profile(&self, schema: Schema, user_uuid: &str)
    -> DatabaseResult<Option<SubjectProfile>>;

    /// Sums per prosthesis type of the subject's events inside `period`
    async fn totals_by_type(
        &self,
        schema: Schema,
        user_uuid: &str,
        period: &Period,
    ) -> DatabaseResult<Vec<TypeTotals>>;

    async fn health_check(&self) -> DatabaseResult<bool>;
}
