//! Report cache: object storage for generated reports
//!
//! Reports are stored as JSON objects under
//! `{schema}/{user_uuid}/{start|none}__{end|none}.json`. Hard deletion is left
//! to the bucket's own lifecycle policy; the soft expiry lives inside the
//! stored document.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Builder as S3ConfigBuilder, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::ReportsConfig;
use crate::models::{Period, Schema};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Report store unavailable: {0}")]
    Unavailable(String),

    #[error("Report store request failed: {0}")]
    Request(String),
}

/// Thin get/put interface over the report store
#[async_trait]
pub trait ReportCache: Send + Sync {
    /// Raw object body, `None` when no object exists under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), CacheError>;
}

fn path_safe(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H-%M-%S").to_string()
}

/// Deterministic object key of a report request.
///
/// Sub-second precision is dropped and colons are replaced, so requests that
/// differ only below one second share an object.
pub fn cache_key(schema: Schema, user_uuid: &str, period: &Period) -> String {
    let bound = |ts: &Option<DateTime<Utc>>| {
        ts.as_ref()
            .map(path_safe)
            .unwrap_or_else(|| "none".to_string())
    };
    format!(
        "{}/{}/{}__{}.json",
        schema.as_str(),
        user_uuid,
        bound(&period.start),
        bound(&period.end)
    )
}

/// S3-compatible store (AWS S3 or MinIO)
#[derive(Clone)]
pub struct S3ReportCache {
    client: Client,
    bucket: String,
}

impl S3ReportCache {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Client from the default AWS credential chain; a custom endpoint
    /// switches to path-style addressing for MinIO.
    pub async fn from_config(config: &ReportsConfig) -> Self {
        let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let mut builder = S3ConfigBuilder::from(&shared);

        if shared.region().is_none() {
            builder = builder.region(Region::new("us-east-1"));
        }
        if let Some(endpoint) = &config.s3_endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::new(
            Client::from_conf(builder.build()),
            config.reports_bucket.clone(),
        )
    }

    /// Create the bucket unless it already exists.
    pub async fn ensure_bucket(&self) -> Result<(), CacheError> {
        let head = self.client.head_bucket().bucket(&self.bucket).send().await;
        let missing = match head {
            Ok(_) => false,
            Err(e) => {
                let e = e.into_service_error();
                if !e.is_not_found() {
                    return Err(CacheError::Unavailable(DisplayErrorContext(&e).to_string()));
                }
                true
            }
        };

        if missing {
            info!("Bucket {} not found, creating it", self.bucket);
            self.client
                .create_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map_err(|e| CacheError::Request(DisplayErrorContext(&e).to_string()))?;
        }

        info!("Bucket {} is ready", self.bucket);
        Ok(())
    }
}

#[async_trait]
impl ReportCache for S3ReportCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                let e = e.into_service_error();
                if e.is_no_such_key() {
                    return Ok(None);
                }
                return Err(CacheError::Unavailable(DisplayErrorContext(&e).to_string()));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Some(data.into_bytes().to_vec()))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), CacheError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| CacheError::Request(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}

/// In-process store for local runs and tests
#[derive(Default)]
pub struct MemoryReportCache {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryReportCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryReportCache {
    /// Make every read fail as if the store were down.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail as if the store were down.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ReportCache for MemoryReportCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("connection refused".to_string()));
        }
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("connection refused".to_string()));
        }
        self.objects.write().await.insert(key.to_string(), body);
        Ok(())
    }
}
