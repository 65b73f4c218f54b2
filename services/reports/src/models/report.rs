//! Report request and artifact models

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Which copy of the aggregate tables a report is read from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schema {
    /// Tables loaded by the batch import
    #[default]
    Default,
    /// Tables fed by change data capture
    Debezium,
}

impl Schema {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schema::Default => "default",
            Schema::Debezium => "debezium",
        }
    }

    pub fn users_table(&self) -> &'static str {
        match self {
            Schema::Default => r#""default".users"#,
            Schema::Debezium => "debezium.users",
        }
    }

    pub fn events_table(&self) -> &'static str {
        match self {
            Schema::Default => r#""default".telemetry_events"#,
            Schema::Debezium => "debezium.telemetry_events",
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open reporting period `[start, end)`; a missing bound is unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Period {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Period {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| ts >= start) && self.end.is_none_or(|end| ts < end)
    }
}

/// Body of `POST /reports`
#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub start_ts: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    pub end_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub schema: Schema,
    #[serde(default)]
    pub user_uuid: Option<String>,
}

impl ReportRequest {
    pub fn period(&self) -> Period {
        Period {
            start: self.start_ts,
            end: self.end_ts,
        }
    }
}

/// Accepts RFC 3339, or a naive date/time which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("Invalid timestamp: {}", raw))
}

fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Per prosthesis type statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProsthesisStats {
    pub prosthesis_type: String,
    pub events_count: i64,
    pub total_duration: i64,
    pub avg_amplitude: f64,
    pub avg_frequency: f64,
}

/// Computed report for one subject and period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub user_name: String,
    pub user_email: String,
    pub total_events: i64,
    pub total_duration: i64,
    pub prosthesis_stats: Vec<ProsthesisStats>,
}

/// A report as kept in the cache, with its soft expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    #[serde(flatten)]
    pub report: Report,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_days: i64,
}

impl StoredReport {
    pub fn new(report: Report, now: DateTime<Utc>, ttl_days: i64) -> Self {
        Self {
            report,
            created_at: now,
            expires_at: now + Duration::days(ttl_days),
            ttl_days,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Response of `POST /reports`
#[derive(Debug, Clone, Serialize)]
pub struct ReportResponse {
    #[serde(flatten)]
    pub stored: StoredReport,
    /// Served from the cache rather than computed for this request
    pub cached: bool,
}
