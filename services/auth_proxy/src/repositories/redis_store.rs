//! Redis-backed session store
//!
//! Layout:
//! - `session:{id}` holds the [`SessionPointer`] of every issued id until it expires
//! - `user_session:{subject}` holds the subject's current [`SessionRecord`]
//! - `oauth_state:{state}` holds a pending [`LoginState`]
//!
//! Rotation, token updates and chain-scoped deletes run as Lua scripts so the
//! compare and the write happen in one server-side step. The scripts derive the
//! record key from the pointer they read, so they assume a non-clustered Redis.
//!
//! With a [`TokenCipher`] configured, access and refresh tokens are sealed
//! before they are written. The scripts only move the sealed strings around.

use async_trait::async_trait;
use common::cache::RedisPool;
use redis::Script;
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::{SessionStore, StoreError, StoreResult};
use crate::crypto::{TokenCipher, is_sealed};
use crate::models::{
    LoginState, Lookup, Replay, Rotation, SessionPointer, SessionRecord, TokenSet, classify,
};

const POINTER_PREFIX: &str = "session:";
const RECORD_PREFIX: &str = "user_session:";
const LOGIN_STATE_PREFIX: &str = "oauth_state:";

// KEYS[1] pointer key of the presented id
// ARGV: presented, fresh, ttl, now, record prefix, pointer prefix
static ROTATE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local pointer_raw = redis.call('GET', KEYS[1])
if not pointer_raw then
    return {'unknown'}
end
local pointer = cjson.decode(pointer_raw)
local record_key = ARGV[5] .. pointer.subject_id
local record_raw = redis.call('GET', record_key)
if not record_raw then
    return {'unknown'}
end
local record = cjson.decode(record_raw)
if record.chain_id ~= pointer.chain_id then
    return {'unknown'}
end
if record.session_id == ARGV[1] then
    record.session_id = ARGV[2]
    record.generation = record.generation + 1
    record.last_used_at = tonumber(ARGV[4])
    local encoded = cjson.encode(record)
    local fresh_pointer = cjson.encode({
        subject_id = record.subject_id,
        chain_id = record.chain_id,
        generation = record.generation,
    })
    redis.call('SET', record_key, encoded, 'EX', ARGV[3])
    redis.call('SET', ARGV[6] .. ARGV[2], fresh_pointer, 'EX', ARGV[3])
    return {'rotated', encoded}
end
if pointer.generation < record.generation then
    redis.call('DEL', record_key)
    return {'superseded', pointer.subject_id, pointer.chain_id,
        tostring(pointer.generation), tostring(record.generation)}
end
return {'unknown'}
"#,
    )
});

// KEYS[1] record key; ARGV: chain, access, refresh, expires_at
static UPDATE_TOKENS_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return {'missing'}
end
local record = cjson.decode(raw)
if record.chain_id ~= ARGV[1] then
    return {'missing'}
end
record.access_token = ARGV[2]
record.refresh_token = ARGV[3]
record.access_token_expires_at = tonumber(ARGV[4])
redis.call('SET', KEYS[1], cjson.encode(record), 'KEEPTTL')
return {'updated'}
"#,
    )
});

// KEYS[1] record key; ARGV: chain
static INVALIDATE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local raw = redis.call('GET', KEYS[1])
if raw and cjson.decode(raw).chain_id == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return {'deleted'}
end
return {'kept'}
"#,
    )
});

/// Session store over a shared Redis
#[derive(Clone)]
pub struct RedisSessionStore {
    redis_pool: RedisPool,
    session_ttl: u64,
    login_state_ttl: u64,
    cipher: Option<TokenCipher>,
}

impl RedisSessionStore {
    pub fn new(redis_pool: RedisPool, session_ttl: u64, login_state_ttl: u64) -> Self {
        Self {
            redis_pool,
            session_ttl,
            login_state_ttl,
            cipher: None,
        }
    }

    /// Seal tokens at rest with `cipher`; `None` stores them as issued.
    pub fn with_cipher(mut self, cipher: Option<TokenCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    fn pointer_key(session_id: &str) -> String {
        format!("{}{}", POINTER_PREFIX, session_id)
    }

    fn record_key(subject_id: &str) -> String {
        format!("{}{}", RECORD_PREFIX, subject_id)
    }

    async fn read_record(&self, subject_id: &str) -> StoreResult<Option<SessionRecord>> {
        match self.redis_pool.get(&Self::record_key(subject_id)).await? {
            Some(raw) => Ok(Some(open_record(
                serde_json::from_str(&raw)?,
                self.cipher.as_ref(),
            )?)),
            None => Ok(None),
        }
    }
}

fn seal_token(token: &str, cipher: Option<&TokenCipher>) -> StoreResult<String> {
    match cipher {
        Some(cipher) => Ok(cipher.seal(token)?),
        None => Ok(token.to_string()),
    }
}

fn open_token(stored: &str, cipher: Option<&TokenCipher>) -> StoreResult<String> {
    match cipher {
        Some(cipher) => Ok(cipher.open(stored)?),
        None if is_sealed(stored) => Err(StoreError::Corrupt(
            "Token is encrypted but no encryption key is configured".to_string(),
        )),
        None => Ok(stored.to_string()),
    }
}

/// Copy of `record` with its tokens sealed for storage
fn seal_record(record: &SessionRecord, cipher: Option<&TokenCipher>) -> StoreResult<SessionRecord> {
    Ok(SessionRecord {
        access_token: seal_token(&record.access_token, cipher)?,
        refresh_token: seal_token(&record.refresh_token, cipher)?,
        ..record.clone()
    })
}

fn open_record(mut record: SessionRecord, cipher: Option<&TokenCipher>) -> StoreResult<SessionRecord> {
    record.access_token = open_token(&record.access_token, cipher)?;
    record.refresh_token = open_token(&record.refresh_token, cipher)?;
    Ok(record)
}

fn parse_rotation(reply: Vec<String>) -> StoreResult<Rotation> {
    match reply.as_slice() {
        [tag] if tag == "unknown" => Ok(Rotation::Unknown),
        [tag, record] if tag == "rotated" => Ok(Rotation::Rotated(serde_json::from_str(record)?)),
        [tag, subject_id, chain_id, presented, current] if tag == "superseded" => {
            Ok(Rotation::Superseded(Replay {
                subject_id: subject_id.clone(),
                chain_id: chain_id.clone(),
                presented_generation: parse_generation(presented)?,
                current_generation: parse_generation(current)?,
            }))
        }
        other => Err(StoreError::Corrupt(format!(
            "Unexpected rotation reply: {:?}",
            other.first()
        ))),
    }
}

fn parse_generation(raw: &str) -> StoreResult<u64> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("Invalid generation: {}", raw)))
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, record: &SessionRecord) -> StoreResult<()> {
        let entries = vec![
            (
                Self::record_key(&record.subject_id),
                serde_json::to_string(&seal_record(record, self.cipher.as_ref())?)?,
            ),
            (
                Self::pointer_key(&record.session_id),
                serde_json::to_string(&record.pointer())?,
            ),
        ];
        self.redis_pool.set_all(&entries, self.session_ttl).await?;
        debug!(subject = %record.subject_id, chain = %record.chain_id, "Stored new session chain");
        Ok(())
    }

    async fn lookup(&self, session_id: &str) -> StoreResult<Lookup> {
        let Some(raw) = self.redis_pool.get(&Self::pointer_key(session_id)).await? else {
            return Ok(Lookup::Unknown);
        };
        let pointer: SessionPointer = serde_json::from_str(&raw)?;
        let record = self.read_record(&pointer.subject_id).await?;
        Ok(classify(session_id, Some(&pointer), record.as_ref()))
    }

    async fn rotate(&self, presented: &str, fresh: &str, now: i64) -> StoreResult<Rotation> {
        let pointer_key = Self::pointer_key(presented);
        let reply = self
            .redis_pool
            .run_script(
                &ROTATE_SCRIPT,
                &[pointer_key.as_str()],
                &[
                    presented.to_string(),
                    fresh.to_string(),
                    self.session_ttl.to_string(),
                    now.to_string(),
                    RECORD_PREFIX.to_string(),
                    POINTER_PREFIX.to_string(),
                ],
            )
            .await?;
        match parse_rotation(reply)? {
            Rotation::Rotated(record) => Ok(Rotation::Rotated(open_record(
                record,
                self.cipher.as_ref(),
            )?)),
            other => Ok(other),
        }
    }

    async fn current(&self, subject_id: &str) -> StoreResult<Option<SessionRecord>> {
        self.read_record(subject_id).await
    }

    async fn update_tokens(
        &self,
        subject_id: &str,
        chain_id: &str,
        tokens: &TokenSet,
    ) -> StoreResult<bool> {
        let record_key = Self::record_key(subject_id);
        let reply = self
            .redis_pool
            .run_script(
                &UPDATE_TOKENS_SCRIPT,
                &[record_key.as_str()],
                &[
                    chain_id.to_string(),
                    seal_token(&tokens.access_token, self.cipher.as_ref())?,
                    seal_token(&tokens.refresh_token, self.cipher.as_ref())?,
                    tokens.expires_at.to_string(),
                ],
            )
            .await?;
        Ok(reply.first().is_some_and(|tag| tag == "updated"))
    }

    async fn invalidate(&self, subject_id: &str, chain_id: &str) -> StoreResult<()> {
        let record_key = Self::record_key(subject_id);
        let reply = self
            .redis_pool
            .run_script(
                &INVALIDATE_SCRIPT,
                &[record_key.as_str()],
                &[chain_id.to_string()],
            )
            .await?;
        if reply.first().is_some_and(|tag| tag == "kept") {
            warn!(subject = %subject_id, chain = %chain_id, "Chain already replaced, nothing to invalidate");
        }
        Ok(())
    }

    async fn put_login_state(&self, state: &str, login: &LoginState) -> StoreResult<()> {
        self.redis_pool
            .set(
                &format!("{}{}", LOGIN_STATE_PREFIX, state),
                &serde_json::to_string(login)?,
                Some(self.login_state_ttl),
            )
            .await?;
        Ok(())
    }

    async fn take_login_state(&self, state: &str) -> StoreResult<Option<LoginState>> {
        match self
            .redis_pool
            .take(&format!("{}{}", LOGIN_STATE_PREFIX, state))
            .await?
        {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> StoreResult<bool> {
        Ok(self.redis_pool.health_check().await?)
    }
}
