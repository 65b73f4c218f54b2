//! Encryption of identity-provider tokens before they reach the session store
//!
//! A sealed token has the form `enc:v1:{nonce}:{ciphertext}` with both parts
//! URL-safe base64. Values without that prefix are read back unchanged, so
//! records written before a key was configured stay readable.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

#[derive(Error, Debug, PartialEq)]
pub enum CipherError {
    #[error("Encryption key must be 32 bytes of base64: {0}")]
    InvalidKey(String),

    #[error("Token encryption failed")]
    Seal,

    #[error("Token decryption failed: {0}")]
    Open(String),
}

/// Symmetric cipher for session tokens
#[derive(Clone)]
pub struct TokenCipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Key given as URL-safe (Fernet style) or standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let encoded = encoded.trim();
        let raw = URL_SAFE
            .decode(encoded)
            .or_else(|_| STANDARD.decode(encoded))
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = raw
            .try_into()
            .map_err(|raw: Vec<u8>| CipherError::InvalidKey(format!("got {} bytes", raw.len())))?;
        Ok(Self::new(key))
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CipherError::Seal)?;

        Ok(format!(
            "{}{}:{}",
            ENVELOPE_PREFIX,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    pub fn open(&self, stored: &str) -> Result<String, CipherError> {
        let Some(envelope) = stored.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(stored.to_string());
        };
        let (nonce_b64, ciphertext_b64) = envelope
            .split_once(':')
            .ok_or_else(|| CipherError::Open("malformed envelope".to_string()))?;

        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|e| CipherError::Open(e.to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(CipherError::Open("invalid nonce length".to_string()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(|e| CipherError::Open(e.to_string()))?;

        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CipherError::Open("authentication failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CipherError::Open(e.to_string()))
    }
}

/// Whether a stored value is a sealed envelope
pub fn is_sealed(stored: &str) -> bool {
    stored.starts_with(ENVELOPE_PREFIX)
}
