//! Custom error types for the common library
//!
//! This module defines the infrastructure error types shared by the proxy and
//! the report service.

use redis::RedisError;
use sqlx::Error as SqlxError;
use thiserror::Error;

/// Custom error type for database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error occurred during database connection
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    /// Error occurred during database query execution
    #[error("Database query error: {0}")]
    Query(#[source] SqlxError),

    /// Configuration error
    #[error("Database configuration error: {0}")]
    Configuration(String),
}

impl DatabaseError {
    /// Whether the failure means the database could not be reached at all
    /// (as opposed to a query that reached it and failed).
    pub fn is_unavailable(&self) -> bool {
        match self {
            DatabaseError::Connection(_) => true,
            DatabaseError::Query(e) => is_transport_error(e),
            DatabaseError::Configuration(_) => false,
        }
    }
}

fn is_transport_error(error: &SqlxError) -> bool {
    matches!(
        error,
        SqlxError::Io(_) | SqlxError::Tls(_) | SqlxError::PoolTimedOut | SqlxError::PoolClosed
    )
}

/// Type alias for Result with DatabaseError
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Custom error type for Redis operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Could not open a connection to Redis
    #[error("Redis connection error: {0}")]
    Connection(#[source] RedisError),

    /// A command or script failed
    #[error("Redis command error: {0}")]
    Command(#[source] RedisError),
}

/// Type alias for Result with CacheError
pub type CacheResult<T> = Result<T, CacheError>;
