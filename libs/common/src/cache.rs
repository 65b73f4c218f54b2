//! Redis module backing the proxy's session store
//!
//! This module provides the Redis connection handle plus the primitives the
//! session store is built on: plain get/set with TTL, atomic multi-key writes,
//! consume-once reads and server-side scripts for compare-and-swap.

use redis::{AsyncCommands, Client, Script};
use tracing::info;

use crate::error::{CacheError, CacheResult};

/// Configuration for Redis connection
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl RedisConfig {
    /// Create a new RedisConfig from environment variables
    ///
    /// # Environment Variables
    /// - `REDIS_URL`: Redis connection URL (default: "redis://localhost:6379")
    /// - `REDIS_MAX_CONNECTIONS`: Maximum number of connections (default: 10)
    pub fn from_env() -> CacheResult<Self> {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let max_connections = std::env::var("REDIS_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        Ok(RedisConfig {
            url,
            max_connections,
        })
    }
}

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
}

impl RedisPool {
    /// Initialize a new Redis connection pool
    pub async fn new(config: &RedisConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.clone()).map_err(CacheError::Connection)?;
        info!("Redis client initialized with URL: {}", config.url);
        Ok(RedisPool { client })
    }

    /// Get a connection from the pool
    async fn get_connection(&self) -> CacheResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(CacheError::Connection)
    }

    /// Set a key-value pair in Redis with optional TTL
    pub async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;

        if let Some(ttl) = ttl_seconds {
            let _: () = conn
                .set_ex(key, value, ttl)
                .await
                .map_err(CacheError::Command)?;
        } else {
            let _: () = conn.set(key, value).await.map_err(CacheError::Command)?;
        }

        Ok(())
    }

    /// Write several keys in one MULTI/EXEC transaction, all with the same TTL
    pub async fn set_all(&self, entries: &[(String, String)], ttl_seconds: u64) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set_ex(key, value, ttl_seconds).ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Command)?;
        Ok(())
    }

    /// Get a value from Redis by key
    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(CacheError::Command)?;
        Ok(value)
    }

    /// Read a value and delete it in the same step (GETDEL)
    pub async fn take(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Command)?;
        Ok(value)
    }

    /// Run a Lua script atomically on the server and return its reply as strings
    pub async fn run_script(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> CacheResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(CacheError::Command)
    }

    /// Check if Redis is reachable
    pub async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(CacheError::Command)?;
        Ok(pong == "PONG")
    }
}
