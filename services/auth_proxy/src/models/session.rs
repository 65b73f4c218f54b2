//! Session model and the rules for classifying a presented session id

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tokens obtained from the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds) after which the access token is unusable
    pub expires_at: i64,
}

/// Server-side session of one subject
///
/// Only one record exists per subject. `session_id` is the single id that is
/// currently accepted; every rotation replaces it and bumps `generation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub subject_id: String,
    pub username: String,
    /// Random id of the login this record descends from
    pub chain_id: String,
    pub generation: u64,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: i64,
    pub created_at: i64,
    pub last_used_at: i64,
}

impl SessionRecord {
    /// A fresh record at generation 0 for a completed login.
    pub fn new(subject_id: String, username: String, tokens: TokenSet, now: i64) -> Self {
        Self {
            session_id: generate_session_id(),
            subject_id,
            username,
            chain_id: Uuid::new_v4().to_string(),
            generation: 0,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_token_expires_at: tokens.expires_at,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn pointer(&self) -> SessionPointer {
        SessionPointer {
            subject_id: self.subject_id.clone(),
            chain_id: self.chain_id.clone(),
            generation: self.generation,
        }
    }

    pub fn tokens(&self) -> TokenSet {
        TokenSet {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.access_token_expires_at,
        }
    }

    pub fn with_tokens(mut self, tokens: TokenSet) -> Self {
        self.access_token = tokens.access_token;
        self.refresh_token = tokens.refresh_token;
        self.access_token_expires_at = tokens.expires_at;
        self
    }

    pub fn access_token_expired(&self, now: i64) -> bool {
        now >= self.access_token_expires_at
    }

    /// Advance to a new id, as one rotation step.
    pub fn rotated(mut self, fresh_id: String, now: i64) -> Self {
        self.session_id = fresh_id;
        self.generation += 1;
        self.last_used_at = now;
        self
    }
}

/// What an issued session id points at. Kept for superseded ids too, so a
/// replayed id can be told apart from one that was never issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPointer {
    pub subject_id: String,
    pub chain_id: String,
    pub generation: u64,
}

/// Pending authorization request, keyed by its `state` parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginState {
    pub pkce_verifier: String,
    pub redirect_to: String,
    pub created_at: i64,
}

/// A presented id that belongs to an older generation of a live chain
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub subject_id: String,
    pub chain_id: String,
    pub presented_generation: u64,
    pub current_generation: u64,
}

/// Read-only classification of a presented id
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Current(SessionRecord),
    Superseded(Replay),
    Unknown,
}

/// Outcome of an attempted rotation
#[derive(Debug, Clone, PartialEq)]
pub enum Rotation {
    /// The presented id was current and has been replaced
    Rotated(SessionRecord),
    /// The presented id was stale; the chain has been destroyed
    Superseded(Replay),
    Unknown,
}

/// Classify `presented` against its pointer and the subject's current record.
pub fn classify(
    presented: &str,
    pointer: Option<&SessionPointer>,
    record: Option<&SessionRecord>,
) -> Lookup {
    let (Some(pointer), Some(record)) = (pointer, record) else {
        return Lookup::Unknown;
    };

    if record.chain_id != pointer.chain_id {
        return Lookup::Unknown;
    }

    if record.session_id == presented {
        return Lookup::Current(record.clone());
    }

    if pointer.generation < record.generation {
        return Lookup::Superseded(Replay {
            subject_id: pointer.subject_id.clone(),
            chain_id: pointer.chain_id.clone(),
            presented_generation: pointer.generation,
            current_generation: record.generation,
        });
    }

    Lookup::Unknown
}

/// 256 bits from the OS generator, URL-safe base64 without padding.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
