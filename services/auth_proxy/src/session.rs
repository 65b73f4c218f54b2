//! Session management: login, rotation, replay detection and token refresh

use chrono::Utc;
use common::telemetry::redact;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{
    LoginState, Lookup, Rotation, SessionRecord, TokenSet, UserInfo, generate_session_id,
};
use crate::oauth::{AuthorizationRequest, IdentityClient, IdentityError};
use crate::refresh_guard::RefreshGuard;
use crate::repositories::{SessionStore, StoreError};

/// Why a session could not be used
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No valid session")]
    Unauthenticated,

    /// A superseded id was presented and the chain was destroyed
    #[error("Superseded session id presented")]
    Anomaly,

    /// Refresh was refused; the session has been torn down
    #[error("Token refresh failed")]
    RefreshFailed,

    #[error("Identity provider unavailable: {0}")]
    IdentityUnavailable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a login callback was refused
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("State does not match the login cookie")]
    StateMismatch,

    #[error("Unknown or expired login state")]
    UnknownState,

    #[error("Code exchange failed: {0}")]
    Exchange(IdentityError),

    #[error("Issued token failed verification: {0}")]
    Verification(IdentityError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LoginError {
    /// Short code appended to the frontend URL
    pub fn reason(&self) -> &'static str {
        match self {
            LoginError::StateMismatch => "state_mismatch",
            LoginError::UnknownState => "invalid_state",
            LoginError::Exchange(_) => "token_exchange_failed",
            LoginError::Verification(_) => "invalid_token",
            LoginError::Store(_) => "session_unavailable",
        }
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Session manager for handling subject sessions
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    identity: Arc<dyn IdentityClient>,
    refresh_guard: RefreshGuard,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, identity: Arc<dyn IdentityClient>) -> Self {
        Self {
            store,
            identity,
            refresh_guard: RefreshGuard::new(),
        }
    }

    /// Start a login: fresh PKCE pair and state, remembered server-side.
    pub async fn begin_login(&self, redirect_to: String) -> Result<AuthorizationRequest, StoreError> {
        let request = self.identity.authorization_request();
        let login = LoginState {
            pkce_verifier: request.pkce_verifier.clone(),
            redirect_to,
            created_at: now(),
        };
        self.store.put_login_state(&request.state, &login).await?;

        info!(state = redact(&request.state), "Redirecting to identity provider");
        Ok(request)
    }

    /// Finish a login and open a new session chain at generation 0.
    ///
    /// Returns the new record and where the browser should go next.
    pub async fn complete_login(
        &self,
        code: &str,
        state: &str,
        cookie_state: Option<&str>,
    ) -> Result<(SessionRecord, String), LoginError> {
        if cookie_state != Some(state) {
            return Err(LoginError::StateMismatch);
        }

        let login = self
            .store
            .take_login_state(state)
            .await?
            .ok_or(LoginError::UnknownState)?;

        let tokens = self
            .identity
            .exchange_code(code, &login.pkce_verifier)
            .await
            .map_err(LoginError::Exchange)?;

        let claims = self
            .identity
            .verify(&tokens.access_token)
            .await
            .map_err(LoginError::Verification)?;

        let username = claims
            .preferred_username
            .clone()
            .unwrap_or_else(|| claims.sub.clone());
        let record = SessionRecord::new(claims.sub.clone(), username, tokens, now());
        self.store.create(&record).await?;

        info!(subject = %record.subject_id, chain = %record.chain_id, "Login completed");
        Ok((record, login.redirect_to))
    }

    /// Read-only classification of a presented id.
    pub async fn lookup(&self, session_id: &str) -> Result<Lookup, StoreError> {
        self.store.lookup(session_id).await
    }

    /// Guard for privileged calls: rotate the presented id or refuse the call.
    pub async fn authorize_and_rotate(&self, presented: &str) -> Result<SessionRecord, SessionError> {
        let fresh = generate_session_id();
        match self.store.rotate(presented, &fresh, now()).await? {
            Rotation::Rotated(record) => {
                debug!(subject = %record.subject_id, generation = record.generation, "Session rotated");
                Ok(record)
            }
            Rotation::Superseded(replay) => {
                warn!(
                    subject = %replay.subject_id,
                    session = redact(presented),
                    presented_generation = replay.presented_generation,
                    current_generation = replay.current_generation,
                    "Superseded session id replayed, chain invalidated"
                );
                Err(SessionError::Anomaly)
            }
            Rotation::Unknown => {
                debug!(session = redact(presented), "Unknown session id");
                Err(SessionError::Unauthenticated)
            }
        }
    }

    /// Tokens usable for an upstream call, refreshing first when the access
    /// token has already expired. The flag tells whether a refresh happened.
    pub async fn usable_tokens(&self, record: &SessionRecord) -> Result<(TokenSet, bool), SessionError> {
        if record.access_token_expired(now()) {
            Ok((self.refresh_tokens(record).await?, true))
        } else {
            Ok((record.tokens(), false))
        }
    }

    /// Refresh the subject's tokens, at most one refresh per subject at a time.
    ///
    /// A waiter that finds the refresh token already replaced reuses the
    /// result of the refresh it waited for. On refusal the chain is destroyed.
    pub async fn refresh_tokens(&self, record: &SessionRecord) -> Result<TokenSet, SessionError> {
        let _held = self.refresh_guard.lock(&record.subject_id).await;

        let current = match self.store.current(&record.subject_id).await? {
            Some(current) if current.chain_id == record.chain_id => current,
            _ => return Err(SessionError::Unauthenticated),
        };

        if current.refresh_token != record.refresh_token {
            debug!(subject = %record.subject_id, "Tokens already refreshed by a concurrent call");
            return Ok(current.tokens());
        }

        match self.identity.refresh(&current.refresh_token).await {
            Ok(tokens) => {
                if !self
                    .store
                    .update_tokens(&current.subject_id, &current.chain_id, &tokens)
                    .await?
                {
                    return Err(SessionError::Unauthenticated);
                }
                info!(subject = %current.subject_id, "Access token refreshed");
                Ok(tokens)
            }
            Err(e) if e.is_unavailable() => {
                warn!(subject = %current.subject_id, error = %e, "Token refresh could not reach the identity provider");
                Err(SessionError::IdentityUnavailable(e.to_string()))
            }
            Err(e) => {
                warn!(subject = %current.subject_id, error = %e, "Token refresh refused, closing session");
                self.store
                    .invalidate(&current.subject_id, &current.chain_id)
                    .await?;
                Err(SessionError::RefreshFailed)
            }
        }
    }

    /// Identity projection for `/user_info`. Never rotates the session.
    pub async fn user_info(&self, presented: Option<&str>) -> Result<UserInfo, SessionError> {
        let Some(presented) = presented else {
            return Ok(UserInfo::anonymous(false));
        };

        let record = match self.store.lookup(presented).await? {
            Lookup::Current(record) => record,
            Lookup::Superseded(replay) => {
                warn!(
                    subject = %replay.subject_id,
                    session = redact(presented),
                    presented_generation = replay.presented_generation,
                    current_generation = replay.current_generation,
                    "Superseded session id presented to user_info, chain invalidated"
                );
                self.store
                    .invalidate(&replay.subject_id, &replay.chain_id)
                    .await?;
                return Err(SessionError::Anomaly);
            }
            Lookup::Unknown => return Ok(UserInfo::anonymous(true)),
        };

        let tokens = match self.usable_tokens(&record).await {
            Ok((tokens, _)) => tokens,
            Err(SessionError::RefreshFailed | SessionError::Unauthenticated) => {
                return Ok(UserInfo::anonymous(true));
            }
            Err(e) => return Err(e),
        };

        match self.identity.verify(&tokens.access_token).await {
            Ok(claims) => Ok(UserInfo::from_claims(&claims)),
            Err(e) if e.is_unavailable() => Err(SessionError::IdentityUnavailable(e.to_string())),
            Err(e) => {
                warn!(subject = %record.subject_id, error = %e, "Stored access token failed verification, closing session");
                self.store
                    .invalidate(&record.subject_id, &record.chain_id)
                    .await?;
                Ok(UserInfo::anonymous(true))
            }
        }
    }

    /// Destroy the session behind `presented`, ending the provider session too.
    pub async fn sign_out(&self, presented: &str) -> Result<(), StoreError> {
        match self.store.lookup(presented).await? {
            Lookup::Current(record) => {
                if let Err(e) = self.identity.logout(&record.refresh_token).await {
                    warn!(subject = %record.subject_id, error = %e, "Identity provider logout failed");
                }
                self.store
                    .invalidate(&record.subject_id, &record.chain_id)
                    .await?;
                info!(subject = %record.subject_id, "Signed out");
            }
            Lookup::Superseded(replay) => {
                self.store
                    .invalidate(&replay.subject_id, &replay.chain_id)
                    .await?;
                info!(subject = %replay.subject_id, "Signed out with a superseded id");
            }
            Lookup::Unknown => {}
        }
        Ok(())
    }

    pub async fn health_check(&self) -> Result<bool, StoreError> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::stub::StubIdentity;
    use crate::repositories::MemorySessionStore;
    use std::sync::atomic::Ordering;

    fn manager(identity: Arc<StubIdentity>) -> SessionManager {
        SessionManager::new(Arc::new(MemorySessionStore::new(3600, 300)), identity)
    }

    async fn signed_in(manager: &SessionManager) -> SessionRecord {
        let request = manager
            .begin_login("http://localhost:3000/reports".to_string())
            .await
            .unwrap();
        let (record, redirect_to) = manager
            .complete_login("code", &request.state, Some(&request.state))
            .await
            .unwrap();
        assert_eq!(redirect_to, "http://localhost:3000/reports");
        record
    }

    #[tokio::test]
    async fn test_complete_login_creates_generation_zero() {
        let manager = manager(Arc::new(StubIdentity::new()));
        let record = signed_in(&manager).await;

        assert_eq!(record.generation, 0);
        assert_eq!(record.subject_id, "subject-1");
        assert_eq!(record.username, "prothetic1");
        assert_eq!(
            manager.lookup(&record.session_id).await.unwrap(),
            Lookup::Current(record)
        );
    }

    #[tokio::test]
    async fn test_complete_login_rejects_state_mismatch_and_reuse() {
        let manager = manager(Arc::new(StubIdentity::new()));
        let request = manager.begin_login("/".to_string()).await.unwrap();

        assert!(matches!(
            manager
                .complete_login("code", &request.state, Some("other"))
                .await,
            Err(LoginError::StateMismatch)
        ));
        assert!(matches!(
            manager.complete_login("code", &request.state, None).await,
            Err(LoginError::StateMismatch)
        ));

        manager
            .complete_login("code", &request.state, Some(&request.state))
            .await
            .unwrap();
        let replayed = manager
            .complete_login("code", &request.state, Some(&request.state))
            .await
            .unwrap_err();
        assert_eq!(replayed.reason(), "invalid_state");
    }

    #[tokio::test]
    async fn test_complete_login_reports_failed_exchange() {
        let manager = manager(Arc::new(StubIdentity::new()));
        let request = manager.begin_login("/".to_string()).await.unwrap();
        let error = manager
            .complete_login("bad-code", &request.state, Some(&request.state))
            .await
            .unwrap_err();
        assert_eq!(error.reason(), "token_exchange_failed");
    }

    #[tokio::test]
    async fn test_replayed_id_is_an_anomaly_and_forces_relogin() {
        let manager = manager(Arc::new(StubIdentity::new()));
        let first = signed_in(&manager).await;
        let second = manager.authorize_and_rotate(&first.session_id).await.unwrap();
        assert_eq!(second.generation, 1);

        assert!(matches!(
            manager.authorize_and_rotate(&first.session_id).await,
            Err(SessionError::Anomaly)
        ));
        assert!(matches!(
            manager.authorize_and_rotate(&second.session_id).await,
            Err(SessionError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_is_unauthenticated() {
        let manager = manager(Arc::new(StubIdentity::new()));
        assert!(matches!(
            manager.authorize_and_rotate("never-issued").await,
            Err(SessionError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_grant() {
        let identity = Arc::new(StubIdentity::new());
        identity.refresh_delay_ms.store(20, Ordering::SeqCst);
        let manager = manager(identity.clone());
        let record = signed_in(&manager).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            let record = record.clone();
            handles.push(tokio::spawn(async move {
                manager.refresh_tokens(&record).await.unwrap()
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn test_refused_refresh_tears_session_down() {
        let identity = Arc::new(StubIdentity::new());
        identity.fail_refresh.store(true, Ordering::SeqCst);
        let manager = manager(identity);
        let record = signed_in(&manager).await;

        assert!(matches!(
            manager.refresh_tokens(&record).await,
            Err(SessionError::RefreshFailed)
        ));
        assert_eq!(
            manager.lookup(&record.session_id).await.unwrap(),
            Lookup::Unknown
        );
    }

    #[tokio::test]
    async fn test_expired_access_token_is_refreshed_before_use() {
        let identity = Arc::new(StubIdentity::new());
        identity.issue_expired.store(true, Ordering::SeqCst);
        let manager = manager(identity.clone());
        let record = signed_in(&manager).await;

        let (tokens, refreshed) = manager.usable_tokens(&record).await.unwrap();
        assert!(refreshed);
        assert_ne!(tokens.access_token, record.access_token);
        assert_eq!(identity.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_user_info_does_not_rotate() {
        let manager = manager(Arc::new(StubIdentity::new()));
        let record = signed_in(&manager).await;

        for _ in 0..3 {
            let info = manager.user_info(Some(&record.session_id)).await.unwrap();
            assert!(info.is_authorized);
            assert_eq!(info.sub.as_deref(), Some("subject-1"));
        }
        assert_eq!(
            manager.lookup(&record.session_id).await.unwrap(),
            Lookup::Current(record)
        );
    }

    #[tokio::test]
    async fn test_user_info_without_usable_session() {
        let manager = manager(Arc::new(StubIdentity::new()));
        assert_eq!(
            manager.user_info(None).await.unwrap(),
            UserInfo::anonymous(false)
        );
        assert_eq!(
            manager.user_info(Some("unknown")).await.unwrap(),
            UserInfo::anonymous(true)
        );
    }

    #[tokio::test]
    async fn test_user_info_with_superseded_id_is_an_anomaly() {
        let manager = manager(Arc::new(StubIdentity::new()));
        let first = signed_in(&manager).await;
        let second = manager.authorize_and_rotate(&first.session_id).await.unwrap();

        assert!(matches!(
            manager.user_info(Some(&first.session_id)).await,
            Err(SessionError::Anomaly)
        ));
        assert_eq!(
            manager.lookup(&second.session_id).await.unwrap(),
            Lookup::Unknown
        );
    }

    #[tokio::test]
    async fn test_user_info_closes_session_with_rejected_token() {
        let identity = Arc::new(StubIdentity::new());
        let manager = manager(identity.clone());
        let record = signed_in(&manager).await;
        identity.reject_tokens.store(true, Ordering::SeqCst);

        assert_eq!(
            manager.user_info(Some(&record.session_id)).await.unwrap(),
            UserInfo::anonymous(true)
        );
        assert_eq!(
            manager.lookup(&record.session_id).await.unwrap(),
            Lookup::Unknown
        );
    }

    #[tokio::test]
    async fn test_sign_out_destroys_session() {
        let identity = Arc::new(StubIdentity::new());
        let manager = manager(identity.clone());
        let record = signed_in(&manager).await;

        manager.sign_out(&record.session_id).await.unwrap();
        assert_eq!(identity.logout_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.authorize_and_rotate(&record.session_id).await,
            Err(SessionError::Unauthenticated)
        ));
    }
}
