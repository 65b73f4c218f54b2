//! In-process session store
//!
//! Same semantics as the Redis store, with one mutex standing in for Redis'
//! single-threaded script execution. Used by tests and single-node setups.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{SessionStore, StoreResult};
use crate::models::{
    LoginState, Lookup, Rotation, SessionPointer, SessionRecord, TokenSet, classify,
};

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    pointers: HashMap<String, Expiring<SessionPointer>>,
    records: HashMap<String, Expiring<SessionRecord>>,
    logins: HashMap<String, Expiring<LoginState>>,
}

impl MemoryState {
    fn pointer(&self, session_id: &str) -> Option<&SessionPointer> {
        self.pointers
            .get(session_id)
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.value)
    }

    fn record(&self, subject_id: &str) -> Option<&SessionRecord> {
        self.records
            .get(subject_id)
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.value)
    }

    fn purge_expired(&mut self) {
        self.pointers.retain(|_, entry| entry.is_live());
        self.records.retain(|_, entry| entry.is_live());
        self.logins.retain(|_, entry| entry.is_live());
    }
}

/// Session store kept in process memory
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    state: Arc<Mutex<MemoryState>>,
    session_ttl: Duration,
    login_state_ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(session_ttl: u64, login_state_ttl: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            session_ttl: Duration::from_secs(session_ttl),
            login_state_ttl: Duration::from_secs(login_state_ttl),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, record: &SessionRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        state.records.insert(
            record.subject_id.clone(),
            Expiring::new(record.clone(), self.session_ttl),
        );
        state.pointers.insert(
            record.session_id.clone(),
            Expiring::new(record.pointer(), self.session_ttl),
        );
        Ok(())
    }

    async fn lookup(&self, session_id: &str) -> StoreResult<Lookup> {
        let state = self.state.lock().await;
        let pointer = state.pointer(session_id);
        let record = pointer.and_then(|p| state.record(&p.subject_id));
        Ok(classify(session_id, pointer, record))
    }

    async fn rotate(&self, presented: &str, fresh: &str, now: i64) -> StoreResult<Rotation> {
        let mut state = self.state.lock().await;

        let pointer = state.pointer(presented).cloned();
        let record = pointer
            .as_ref()
            .and_then(|p| state.record(&p.subject_id))
            .cloned();

        match classify(presented, pointer.as_ref(), record.as_ref()) {
            Lookup::Current(record) => {
                let rotated = record.rotated(fresh.to_string(), now);
                state.pointers.insert(
                    fresh.to_string(),
                    Expiring::new(rotated.pointer(), self.session_ttl),
                );
                state.records.insert(
                    rotated.subject_id.clone(),
                    Expiring::new(rotated.clone(), self.session_ttl),
                );
                Ok(Rotation::Rotated(rotated))
            }
            Lookup::Superseded(replay) => {
                state.records.remove(&replay.subject_id);
                Ok(Rotation::Superseded(replay))
            }
            Lookup::Unknown => Ok(Rotation::Unknown),
        }
    }

    async fn current(&self, subject_id: &str) -> StoreResult<Option<SessionRecord>> {
        let state = self.state.lock().await;
        Ok(state.record(subject_id).cloned())
    }

    async fn update_tokens(
        &self,
        subject_id: &str,
        chain_id: &str,
        tokens: &TokenSet,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(subject_id) {
            Some(entry) if entry.is_live() && entry.value.chain_id == chain_id => {
                entry.value = entry.value.clone().with_tokens(tokens.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate(&self, subject_id: &str, chain_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .records
            .get(subject_id)
            .is_some_and(|entry| entry.value.chain_id == chain_id)
        {
            state.records.remove(subject_id);
        }
        Ok(())
    }

    async fn put_login_state(&self, key: &str, login: &LoginState) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.logins.insert(
            key.to_string(),
            Expiring::new(login.clone(), self.login_state_ttl),
        );
        Ok(())
    }

    async fn take_login_state(&self, key: &str) -> StoreResult<Option<LoginState>> {
        let mut state = self.state.lock().await;
        Ok(state
            .logins
            .remove(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value))
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::generate_session_id;

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "access-0".to_string(),
            refresh_token: "refresh-0".to_string(),
            expires_at: 1_000,
        }
    }

    async fn logged_in(store: &MemorySessionStore) -> SessionRecord {
        let record = SessionRecord::new("subject-1".to_string(), "user".to_string(), tokens(), 0);
        store.create(&record).await.unwrap();
        record
    }

    async fn rotate_ok(store: &MemorySessionStore, id: &str) -> SessionRecord {
        match store.rotate(id, &generate_session_id(), 1).await.unwrap() {
            Rotation::Rotated(record) => record,
            other => panic!("expected rotation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_rotations_accept_only_latest_id() {
        let store = MemorySessionStore::new(60, 60);
        let mut record = logged_in(&store).await;
        let mut issued = vec![record.session_id.clone()];

        for _ in 0..5 {
            record = rotate_ok(&store, &record.session_id).await;
            issued.push(record.session_id.clone());
        }

        assert_eq!(record.generation, 5);
        let distinct: std::collections::HashSet<_> = issued.iter().collect();
        assert_eq!(distinct.len(), issued.len());

        for stale in &issued[..issued.len() - 1] {
            assert!(matches!(
                store.lookup(stale).await.unwrap(),
                Lookup::Superseded(_)
            ));
        }
        assert_eq!(
            store.lookup(&record.session_id).await.unwrap(),
            Lookup::Current(record)
        );
    }

    #[tokio::test]
    async fn test_replay_destroys_chain() {
        let store = MemorySessionStore::new(60, 60);
        let first = logged_in(&store).await;
        let second = rotate_ok(&store, &first.session_id).await;

        match store.rotate(&first.session_id, "ignored", 2).await.unwrap() {
            Rotation::Superseded(replay) => {
                assert_eq!(replay.presented_generation, 0);
                assert_eq!(replay.current_generation, 1);
            }
            other => panic!("expected replay, got {other:?}"),
        }

        assert_eq!(
            store.rotate(&second.session_id, "x", 3).await.unwrap(),
            Rotation::Unknown
        );
        assert!(store.current("subject-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_rotation_has_single_winner() {
        let store = MemorySessionStore::new(60, 60);
        let record = logged_in(&store).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = record.session_id.clone();
            handles.push(tokio::spawn(async move {
                store.rotate(&id, &generate_session_id(), 1).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if let Rotation::Rotated(_) = handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_new_login_orphans_previous_chain() {
        let store = MemorySessionStore::new(60, 60);
        let old = logged_in(&store).await;
        let new = logged_in(&store).await;

        assert_eq!(store.lookup(&old.session_id).await.unwrap(), Lookup::Unknown);
        assert_eq!(
            store.lookup(&new.session_id).await.unwrap(),
            Lookup::Current(new)
        );
    }

    #[tokio::test]
    async fn test_update_tokens_is_chain_scoped() {
        let store = MemorySessionStore::new(60, 60);
        let record = logged_in(&store).await;
        let refreshed = TokenSet {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: 2_000,
        };

        assert!(!store
            .update_tokens("subject-1", "other-chain", &refreshed)
            .await
            .unwrap());
        assert!(store
            .update_tokens("subject-1", &record.chain_id, &refreshed)
            .await
            .unwrap());

        let current = store.current("subject-1").await.unwrap().unwrap();
        assert_eq!(current.tokens(), refreshed);
        assert_eq!(current.session_id, record.session_id);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_newer_chain() {
        let store = MemorySessionStore::new(60, 60);
        let old = logged_in(&store).await;
        let new = logged_in(&store).await;

        store.invalidate("subject-1", &old.chain_id).await.unwrap();
        assert!(store.current("subject-1").await.unwrap().is_some());

        store.invalidate("subject-1", &new.chain_id).await.unwrap();
        assert!(store.current("subject-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_state_is_consumed_once() {
        let store = MemorySessionStore::new(60, 60);
        let login = LoginState {
            pkce_verifier: "verifier".to_string(),
            redirect_to: "http://localhost:3000".to_string(),
            created_at: 0,
        };
        store.put_login_state("state-1", &login).await.unwrap();

        assert_eq!(store.take_login_state("state-1").await.unwrap(), Some(login));
        assert_eq!(store.take_login_state("state-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let store = MemorySessionStore::new(0, 0);
        let record = logged_in(&store).await;
        assert_eq!(
            store.lookup(&record.session_id).await.unwrap(),
            Lookup::Unknown
        );
    }
}
