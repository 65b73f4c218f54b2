use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

mod config;
mod cookies;
mod crypto;
mod error;
mod models;
mod oauth;
mod refresh_guard;
mod repositories;
mod routes;
mod session;
mod state;
mod upstream;
mod validation;

use common::cache::{RedisConfig, RedisPool};
use common::telemetry::init_tracing;
use tokio::net::TcpListener;

use crate::{
    config::{ProxySettings, SessionStoreKind},
    crypto::TokenCipher,
    oauth::KeycloakClient,
    repositories::{MemorySessionStore, RedisSessionStore, SessionStore},
    session::SessionManager,
    state::AppState,
    upstream::UpstreamRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("auth_proxy=info,common=info,tower_http=info");

    info!("Starting session proxy");

    let settings = ProxySettings::from_env()?;

    let store: Arc<dyn SessionStore> = match settings.session_store {
        SessionStoreKind::Redis => {
            let redis_config = RedisConfig::from_env()?;
            let pool = RedisPool::new(&redis_config).await?;
            if !pool.health_check().await? {
                anyhow::bail!("Failed to connect to Redis");
            }
            info!("Redis connection successful");

            let cipher = settings
                .encryption_key
                .as_deref()
                .map(TokenCipher::from_base64)
                .transpose()?;
            if cipher.is_none() {
                warn!("AUTH_PROXY_ENCRYPTION_KEY not set, tokens are stored unencrypted");
            }
            Arc::new(
                RedisSessionStore::new(
                    pool,
                    settings.session_lifetime_seconds,
                    settings.login_state_ttl_seconds,
                )
                .with_cipher(cipher),
            )
        }
        SessionStoreKind::Memory => {
            info!("Using in-process session store; sessions will not survive a restart");
            Arc::new(MemorySessionStore::new(
                settings.session_lifetime_seconds,
                settings.login_state_ttl_seconds,
            ))
        }
    };

    let identity = Arc::new(KeycloakClient::new(&settings)?);
    let upstreams = UpstreamRegistry::from_settings(&settings)?;
    let address = settings.bind_address();

    let app_state = AppState {
        settings: Arc::new(settings),
        sessions: SessionManager::new(store, identity),
        upstreams,
    };

    let app = routes::create_router(app_state);

    let listener = TcpListener::bind(&address).await?;
    info!("Session proxy listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}
