use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

mod access;
mod cache;
mod config;
mod error;
mod middleware;
mod models;
mod repositories;
mod routes;
mod service;
mod state;
mod validation;

use common::database::{DatabaseConfig, init_pool};
use common::jwt::{TokenValidator, ValidatorConfig};
use common::telemetry::init_tracing;
use tokio::net::TcpListener;

use crate::{
    access::RolePolicy,
    cache::{MemoryReportCache, ReportCache, S3ReportCache},
    config::{CacheBackend, ReportsConfig},
    repositories::PgTelemetrySource,
    service::{ReportService, RetryPolicy},
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("reports=info,common=info,tower_http=info");

    info!("Starting report service");

    let config = ReportsConfig::from_env();

    // Aggregate source; the pool connects lazily so startup does not wait on it
    let db_config = DatabaseConfig::from_env()?;
    let pool = init_pool(&db_config)?;
    if common::database::health_check(&pool).await? {
        info!("Aggregate source connection successful");
    } else {
        warn!("Aggregate source not reachable yet, reports will fail until it is");
    }

    let cache: Arc<dyn ReportCache> = match config.cache_backend {
        CacheBackend::S3 => {
            let s3 = S3ReportCache::from_config(&config).await;
            s3.ensure_bucket().await?;
            Arc::new(s3)
        }
        CacheBackend::Memory => {
            info!("Using in-process report cache");
            Arc::new(MemoryReportCache::new())
        }
    };

    let mut validator_config = ValidatorConfig::for_realm(&config.keycloak_url, &config.keycloak_realm);
    if let Some(public_url) = &config.keycloak_public_url {
        validator_config = validator_config.with_issuer_alias(public_url, &config.keycloak_realm);
    }
    validator_config.allowed_parties = config.allowed_azp.clone();
    let validator = TokenValidator::new(validator_config)?;

    let reports = ReportService::new(
        Arc::new(PgTelemetrySource::new(pool)),
        cache,
        config.report_ttl_days,
        RetryPolicy {
            attempts: config.aggregate_retry_attempts,
            base_delay: config.aggregate_retry_delay,
        },
    );

    let app_state = AppState {
        validator,
        roles: RolePolicy {
            admin_role: config.admin_role.clone(),
            subject_role: config.subject_role.clone(),
        },
        reports,
        cors_origins: config.cors_origins.clone(),
    };

    let app = routes::create_router(app_state);

    let address = config.bind_address();
    let listener = TcpListener::bind(&address).await?;
    info!("Report service listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down report service");
            }
        })
        .await?;

    Ok(())
}
