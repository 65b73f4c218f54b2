//! Common library for the BionicPRO access services
//!
//! This crate provides shared functionality used by the session proxy and the
//! report service: Redis and PostgreSQL connectivity, bearer-token validation
//! against the identity provider's published keys, tracing setup and the
//! infrastructure error types.

pub mod cache;
pub mod database;
pub mod error;
pub mod jwt;
pub mod telemetry;

/// Example usage of the shared token validator
///
/// ```rust,no_run
/// use common::jwt::{TokenValidator, ValidatorConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ValidatorConfig::for_realm("http://keycloak:8080", "reports-realm");
///     let validator = TokenValidator::new(config)?;
///     let claims = validator.validate("eyJ...").await?;
///     println!("roles: {:?}", claims.roles());
///     Ok(())
/// }
/// ```
pub fn example_usage() {}
