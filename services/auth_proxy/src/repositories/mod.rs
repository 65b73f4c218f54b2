//! Session Store: keyed session storage with atomic rotation

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{LoginState, Lookup, Rotation, SessionRecord, TokenSet};

pub mod memory;
pub mod redis_store;

pub use memory::MemorySessionStore;
pub use redis_store::RedisSessionStore;

/// Session store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session backend error: {0}")]
    Backend(#[from] common::error::CacheError),

    #[error("Corrupt session data: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Corrupt(error.to_string())
    }
}

impl From<crate::crypto::CipherError> for StoreError {
    fn from(error: crate::crypto::CipherError) -> Self {
        StoreError::Corrupt(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage for session records, their id pointers and pending logins
///
/// `rotate` is the only operation that decides whether a presented id is a
/// replay; it must read, compare and replace in one atomic step.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new login, replacing whatever chain the subject had before.
    async fn create(&self, record: &SessionRecord) -> StoreResult<()>;

    /// Classify a presented id without changing anything.
    async fn lookup(&self, session_id: &str) -> StoreResult<Lookup>;

    /// Replace `presented` with `fresh` if it is current. A superseded id
    /// destroys the chain in the same step.
    async fn rotate(&self, presented: &str, fresh: &str, now: i64) -> StoreResult<Rotation>;

    /// The subject's current record, if any.
    async fn current(&self, subject_id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Swap in refreshed tokens. Returns false when the chain is gone.
    async fn update_tokens(
        &self,
        subject_id: &str,
        chain_id: &str,
        tokens: &TokenSet,
    ) -> StoreResult<bool>;

    /// Destroy the subject's session if it still belongs to `chain_id`.
    async fn invalidate(&self, subject_id: &str, chain_id: &str) -> StoreResult<()>;

    async fn put_login_state(&self, state: &str, login: &LoginState) -> StoreResult<()>;

    /// Read and delete a pending login in one step.
    async fn take_login_state(&self, state: &str) -> StoreResult<Option<LoginState>>;

    async fn health_check(&self) -> StoreResult<bool>;
}
