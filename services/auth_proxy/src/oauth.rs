//! Identity Client: OIDC Authorization Code + PKCE against the Keycloak realm

use async_trait::async_trait;
use chrono::Utc;
use common::jwt::{AccessClaims, TokenError, TokenValidator, ValidatorConfig};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse,
    TokenUrl,
    basic::{BasicClient, BasicTokenResponse},
};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ProxySettings;
use crate::models::TokenSet;

const SCOPES: [&str; 3] = ["openid", "profile", "email"];

/// Identity provider failures
#[derive(Error, Debug)]
pub enum IdentityError {
    /// The provider answered and refused the grant
    #[error("Grant rejected: {0}")]
    Rejected(String),

    /// The provider could not be reached
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),

    #[error("Token verification failed: {0}")]
    Token(#[from] TokenError),

    #[error("Identity client misconfigured: {0}")]
    Configuration(String),
}

impl IdentityError {
    pub fn is_unavailable(&self) -> bool {
        match self {
            IdentityError::Unavailable(_) => true,
            IdentityError::Token(e) => e.is_unavailable(),
            _ => false,
        }
    }
}

/// Authorization request ready to be sent to the browser
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub pkce_verifier: String,
}

/// Operations the proxy needs from the identity provider
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Build an authorization URL with a fresh PKCE pair and state.
    fn authorization_request(&self) -> AuthorizationRequest;

    async fn exchange_code(&self, code: &str, pkce_verifier: &str)
    -> Result<TokenSet, IdentityError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdentityError>;

    async fn verify(&self, access_token: &str) -> Result<AccessClaims, IdentityError>;

    /// End the provider-side session. Callers treat failures as non-fatal.
    async fn logout(&self, refresh_token: &str) -> Result<(), IdentityError>;
}

/// Keycloak realm client
///
/// Browser redirects use the public realm URL; token, logout and key requests
/// go to the internal one.
#[derive(Clone)]
pub struct KeycloakClient {
    client: BasicClient,
    client_id: String,
    client_secret: Option<String>,
    logout_url: String,
    validator: TokenValidator,
    http_client: reqwest::Client,
}

impl KeycloakClient {
    pub fn new(settings: &ProxySettings) -> Result<Self, IdentityError> {
        let public_realm = settings.realm_url(&settings.keycloak_public_url);
        let internal_realm = settings.realm_url(&settings.keycloak_url);

        let auth_url = AuthUrl::new(format!("{}/protocol/openid-connect/auth", public_realm))
            .map_err(|e| IdentityError::Configuration(e.to_string()))?;
        let token_url = TokenUrl::new(format!("{}/protocol/openid-connect/token", internal_realm))
            .map_err(|e| IdentityError::Configuration(e.to_string()))?;
        let redirect_url = RedirectUrl::new(settings.callback_url.clone())
            .map_err(|e| IdentityError::Configuration(e.to_string()))?;

        let client = BasicClient::new(
            ClientId::new(settings.client_id.clone()),
            settings.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect_url);

        let mut validator_config =
            ValidatorConfig::for_realm(&settings.keycloak_url, &settings.keycloak_realm)
                .with_issuer_alias(&settings.keycloak_public_url, &settings.keycloak_realm);
        validator_config.allowed_parties = vec![settings.client_id.clone()];
        let validator = TokenValidator::new(validator_config)?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| IdentityError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            logout_url: format!("{}/protocol/openid-connect/logout", internal_realm),
            validator,
            http_client,
        })
    }

    fn token_set(response: &BasicTokenResponse, previous_refresh: Option<&str>) -> TokenSet {
        let lifetime = response
            .expires_in()
            .map(|d| d.as_secs() as i64)
            .unwrap_or(300);
        // Keycloak may keep the refresh token when rotation is disabled in the realm.
        let refresh_token = response
            .refresh_token()
            .map(|t| t.secret().clone())
            .or_else(|| previous_refresh.map(str::to_string))
            .unwrap_or_default();

        TokenSet {
            access_token: response.access_token().secret().clone(),
            refresh_token,
            expires_at: Utc::now().timestamp() + lifetime,
        }
    }
}

fn grant_error<RE, T>(error: RequestTokenError<RE, T>) -> IdentityError
where
    RE: std::error::Error + 'static,
    T: oauth2::ErrorResponse + 'static,
{
    match error {
        RequestTokenError::ServerResponse(response) => {
            IdentityError::Rejected(format!("{:?}", response))
        }
        RequestTokenError::Request(e) => IdentityError::Unavailable(e.to_string()),
        other => IdentityError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl IdentityClient for KeycloakClient {
    fn authorization_request(&self) -> AuthorizationRequest {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = self
            .client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in SCOPES {
            request = request.add_scope(Scope::new(scope.to_string()));
        }
        let (url, state) = request.url();

        AuthorizationRequest {
            url: url.to_string(),
            state: state.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
        }
    }

    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<TokenSet, IdentityError> {
        info!("Exchanging authorization code");

        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(grant_error)?;

        Ok(Self::token_set(&response, None))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdentityError> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(grant_error)?;

        Ok(Self::token_set(&response, Some(refresh_token)))
    }

    async fn verify(&self, access_token: &str) -> Result<AccessClaims, IdentityError> {
        Ok(self.validator.validate(access_token).await?)
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), IdentityError> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http_client
            .post(&self.logout_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Identity provider refused logout");
            return Err(IdentityError::Rejected(format!(
                "Logout returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
