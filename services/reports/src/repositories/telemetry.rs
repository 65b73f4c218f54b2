//! PostgreSQL-backed aggregate source

use async_trait::async_trait;
use common::error::{DatabaseError, DatabaseResult};
use sqlx::{PgPool, Row};

use super::{SubjectProfile, TelemetrySource, TypeTotals};
use crate::models::{Period, Schema};

/// Reads `users` and `telemetry_events` from the schema the request names
#[derive(Clone)]
pub struct PgTelemetrySource {
    pool: PgPool,
}

impl PgTelemetrySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TelemetrySource for PgTelemetrySource {
    async fn profile(
        &self,
        schema: Schema,
        user_uuid: &str,
    ) -> DatabaseResult<Option<SubjectProfile>> {
        let query = format!(
            r#"
            SELECT name, email
            FROM {}
            WHERE user_uuid = $1
            LIMIT 1
            "#,
            schema.users_table()
        );

        let row = sqlx::query(&query)
            .bind(user_uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        match row {
            Some(row) => Ok(Some(SubjectProfile {
                name: row
                    .try_get::<Option<String>, _>("name")
                    .map_err(DatabaseError::Query)?
                    .unwrap_or_default(),
                email: row
                    .try_get::<Option<String>, _>("email")
                    .map_err(DatabaseError::Query)?
                    .unwrap_or_default(),
            })),
            None => Ok(None),
        }
    }

    async fn totals_by_type(
        &self,
        schema: Schema,
        user_uuid: &str,
        period: &Period,
    ) -> DatabaseResult<Vec<TypeTotals>> {
        let query = format!(
            r#"
            SELECT
                prosthesis_type,
                COUNT(*) AS events_count,
                COALESCE(SUM(signal_duration), 0)::BIGINT AS total_duration,
                COALESCE(SUM(signal_amplitude), 0)::DOUBLE PRECISION AS amplitude_sum,
                COALESCE(SUM(signal_frequency), 0)::DOUBLE PRECISION AS frequency_sum
            FROM {}
            WHERE user_uuid = $1
              AND ($2::TIMESTAMP IS NULL OR created_ts >= $2::TIMESTAMP)
              AND ($3::TIMESTAMP IS NULL OR created_ts < $3::TIMESTAMP)
            GROUP BY prosthesis_type
            "#,
            schema.events_table()
        );

        let rows = sqlx::query(&query)
            .bind(user_uuid)
            .bind(period.start.map(|ts| ts.naive_utc()))
            .bind(period.end.map(|ts| ts.naive_utc()))
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::Query)?;

        rows.into_iter()
            .map(|row| {
                Ok(TypeTotals {
                    prosthesis_type: row.try_get("prosthesis_type")?,
                    events_count: row.try_get("events_count")?,
                    total_duration: row.try_get("total_duration")?,
                    amplitude_sum: row.try_get("amplitude_sum")?,
                    frequency_sum: row.try_get("frequency_sum")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(DatabaseError::Query)
    }

    async fn health_check(&self) -> DatabaseResult<bool> {
        common::database::health_check(&self.pool).await
    }
}
