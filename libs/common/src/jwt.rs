//! Bearer-token validation against the identity provider's published keys
//!
//! Both services trust the same realm. The session proxy verifies freshly
//! exchanged access tokens before creating a session; the report service
//! verifies every bearer token it receives. Signing keys come from the realm's
//! JWKS endpoint and are cached by `kid`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Token validation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenError {
    /// Malformed token, bad signature, wrong issuer or disallowed algorithm
    #[error("Invalid token: {0}")]
    Invalid(String),

    #[error("Token expired")]
    Expired,

    /// No published key matches the token's `kid`
    #[error("No signing key matches kid {0:?}")]
    UnknownKey(Option<String>),

    /// The `azp` claim is not one of the accepted clients
    #[error("Token issued to unauthorized party {0:?}")]
    UnauthorizedParty(Option<String>),

    /// The key set could not be fetched or parsed
    #[error("Signing key set unavailable: {0}")]
    KeySet(String),
}

impl TokenError {
    /// True when the failure says nothing about the token itself, only that
    /// the identity provider could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TokenError::KeySet(_))
    }
}

/// Validator configuration
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// JWKS endpoint of the realm
    pub jwks_url: String,
    /// Accepted `iss` values (internal and browser-facing realm URLs)
    pub issuers: Vec<String>,
    /// Accepted signing algorithms
    pub algorithms: Vec<Algorithm>,
    /// Accepted `azp` values; empty accepts any client
    pub allowed_parties: Vec<String>,
    /// How long fetched keys are trusted before a refetch
    pub refresh_interval: Duration,
}

impl ValidatorConfig {
    /// Configuration for a Keycloak realm reachable at `base_url`.
    pub fn for_realm(base_url: &str, realm: &str) -> Self {
        let realm_url = format!("{}/realms/{}", base_url.trim_end_matches('/'), realm);
        Self {
            jwks_url: format!("{}/protocol/openid-connect/certs", realm_url),
            issuers: vec![realm_url],
            algorithms: vec![Algorithm::RS256],
            allowed_parties: Vec::new(),
            refresh_interval: Duration::from_secs(3600),
        }
    }

    /// Also accept tokens issued under another base URL for the same realm.
    pub fn with_issuer_alias(mut self, base_url: &str, realm: &str) -> Self {
        let alias = format!("{}/realms/{}", base_url.trim_end_matches('/'), realm);
        if !self.issuers.contains(&alias) {
            self.issuers.push(alias);
        }
        self
    }
}

/// Realm role container as Keycloak nests it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims carried by an access token of the realm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// Flattened realm roles added by a protocol mapper
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_access: Option<RealmAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_access: Option<serde_json::Value>,
    /// Identifier of the subject in a federated directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_uuid: Option<String>,
}

impl AccessClaims {
    /// Realm roles, preferring the flattened claim over `realm_access.roles`.
    pub fn roles(&self) -> Vec<String> {
        if let Some(roles) = &self.realm_roles {
            return roles.clone();
        }
        self.realm_access
            .as_ref()
            .map(|access| access.roles.clone())
            .unwrap_or_default()
    }

    /// The identity reports are keyed by: the federated id when present, else `sub`.
    pub fn subject_uuid(&self) -> &str {
        match self.external_uuid.as_deref() {
            Some(external) if !external.is_empty() => external,
            _ => &self.sub,
        }
    }
}

/// Cached signing keys
struct KeyCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    #[serde(rename = "use")]
    usage: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Validates access tokens issued by the realm
#[derive(Clone)]
pub struct TokenValidator {
    config: ValidatorConfig,
    cache: Arc<RwLock<Option<KeyCache>>>,
    http_client: reqwest::Client,
    /// Keys were supplied up front and are never refetched
    fixed: bool,
}

impl TokenValidator {
    pub fn new(config: ValidatorConfig) -> Result<Self, TokenError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TokenError::KeySet(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            cache: Arc::new(RwLock::new(None)),
            http_client,
            fixed: false,
        })
    }

    /// Validator over a fixed key set that never contacts the JWKS endpoint.
    pub fn with_static_keys(config: ValidatorConfig, keys: HashMap<String, DecodingKey>) -> Self {
        Self {
            config,
            cache: Arc::new(RwLock::new(Some(KeyCache {
                keys,
                fetched_at: Instant::now(),
            }))),
            http_client: reqwest::Client::new(),
            fixed: true,
        }
    }

    /// Verify signature, expiry, issuer and authorised party, returning the claims.
    pub async fn validate(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let header = decode_header(token).map_err(|e| TokenError::Invalid(e.to_string()))?;

        if !self.config.algorithms.contains(&header.alg) {
            return Err(TokenError::Invalid(format!(
                "Algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let key = self.decoding_key(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        if !self.config.issuers.is_empty() {
            validation.set_issuer(&self.config.issuers);
        }
        validation.validate_aud = false;

        let claims = decode::<AccessClaims>(token, &key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })?
            .claims;

        if !self.config.allowed_parties.is_empty() {
            let allowed = claims
                .azp
                .as_ref()
                .is_some_and(|azp| self.config.allowed_parties.contains(azp));
            if !allowed {
                warn!(azp = ?claims.azp, "Rejected token issued to unexpected client");
                return Err(TokenError::UnauthorizedParty(claims.azp));
            }
        }

        debug!(subject = %claims.sub, "Validated access token");
        Ok(claims)
    }

    /// Find the key for `kid`, refetching the key set when stale or when the kid is new.
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, TokenError> {
        let stale = {
            let cache = self.cache.read().await;
            match &*cache {
                None => true,
                Some(c) => !self.fixed && c.fetched_at.elapsed() > self.config.refresh_interval,
            }
        };

        if stale {
            self.refresh_keys().await?;
        }

        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        if stale || self.fixed {
            return Err(TokenError::UnknownKey(kid.map(str::to_string)));
        }

        // Keys may have been rotated at the provider since the last fetch.
        self.refresh_keys().await?;
        self.cached_key(kid)
            .await
            .ok_or_else(|| TokenError::UnknownKey(kid.map(str::to_string)))
    }

    async fn cached_key(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let cache = self.cache.read().await;
        let cache = cache.as_ref()?;
        match kid {
            Some(kid) => cache.keys.get(kid).cloned(),
            None => cache.keys.values().next().cloned(),
        }
    }

    async fn refresh_keys(&self) -> Result<(), TokenError> {
        debug!(url = %self.config.jwks_url, "Fetching JWKS");

        let jwks: JwksDocument = self
            .http_client
            .get(&self.config.jwks_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| TokenError::KeySet(format!("Failed to fetch JWKS: {}", e)))?
            .json()
            .await
            .map_err(|e| TokenError::KeySet(format!("Invalid JWKS response: {}", e)))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(key) = jwk_to_decoding_key(&jwk)? {
                let kid = jwk.kid.unwrap_or_else(|| "default".to_string());
                keys.insert(kid, key);
            }
        }

        if keys.is_empty() {
            return Err(TokenError::KeySet("No usable signing keys in JWKS".into()));
        }

        info!(key_count = keys.len(), "Refreshed JWKS cache");

        let mut cache = self.cache.write().await;
        *cache = Some(KeyCache {
            keys,
            fetched_at: Instant::now(),
        });

        Ok(())
    }
}

/// Convert a published JWK into a verification key; encryption keys and
/// unsupported key types are skipped.
fn jwk_to_decoding_key(jwk: &JwkKey) -> Result<Option<DecodingKey>, TokenError> {
    if jwk.usage.as_deref() == Some("enc") {
        return Ok(None);
    }

    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_ref()
                .ok_or_else(|| TokenError::KeySet("RSA key missing 'n'".into()))?;
            let e = jwk
                .e
                .as_ref()
                .ok_or_else(|| TokenError::KeySet("RSA key missing 'e'".into()))?;

            DecodingKey::from_rsa_components(n, e)
                .map(Some)
                .map_err(|e| TokenError::KeySet(format!("Invalid RSA key: {}", e)))
        }
        "EC" => {
            let (Some(crv), Some(x), Some(y)) = (&jwk.crv, &jwk.x, &jwk.y) else {
                return Err(TokenError::KeySet("EC key missing coordinates".into()));
            };
            match crv.as_str() {
                "P-256" | "P-384" => DecodingKey::from_ec_components(x, y)
                    .map(Some)
                    .map_err(|e| TokenError::KeySet(format!("Invalid EC key: {}", e))),
                _ => {
                    warn!(crv = %crv, "Unsupported EC curve");
                    Ok(None)
                }
            }
        }
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            Ok(None)
        }
    }
}
