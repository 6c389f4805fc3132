//! HMAC-SHA256 signing and verification of published events.
//!
//! Events are signed over [`SignedEvent::canonical_bytes`] with the active
//! key. Verification looks the key up by the event's `key_id`, so retired
//! keys keep verifying events already in flight while new events use the
//! active one. Key material is held as `SecretString` and never logged.

use std::collections::BTreeMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;
use waypoint_types::event::SignedEvent;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while signing or verifying events.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// No key is registered under the requested id.
    #[error("unknown signing key '{0}'")]
    UnknownKey(String),

    /// The signer has no active key configured.
    #[error("no active signing key configured")]
    NoActiveKey,

    /// The signature is not valid lowercase hex.
    #[error("malformed signature")]
    MalformedSignature,

    /// HMAC verification failed.
    #[error("signature verification failed")]
    VerificationFailed,

    /// The key could not be used to initialise the MAC.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

// ---------------------------------------------------------------------------
// HmacEventSigner
// ---------------------------------------------------------------------------

/// Keyed HMAC-SHA256 signer for `SignedEvent`s.
pub struct HmacEventSigner {
    keys: BTreeMap<String, SecretString>,
    active_key_id: Option<String>,
}

impl std::fmt::Debug for HmacEventSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacEventSigner")
            .field("key_ids", &self.keys.keys().collect::<Vec<_>>())
            .field("active_key_id", &self.active_key_id)
            .finish()
    }
}

impl HmacEventSigner {
    /// Signer with a single key, which is also the active one.
    pub fn new(key_id: impl Into<String>, secret: SecretString) -> Self {
        let key_id = key_id.into();
        let mut keys = BTreeMap::new();
        keys.insert(key_id.clone(), secret);
        Self {
            keys,
            active_key_id: Some(key_id),
        }
    }

    /// Signer over a key ring. `active_key_id` selects the key used for new
    /// signatures; `None` makes the signer verify-only.
    pub fn with_keys(keys: BTreeMap<String, SecretString>, active_key_id: Option<String>) -> Self {
        Self {
            keys,
            active_key_id,
        }
    }

    /// Register an additional (verification) key.
    pub fn add_key(&mut self, key_id: impl Into<String>, secret: SecretString) {
        self.keys.insert(key_id.into(), secret);
    }

    /// Make `key_id` the key used for new signatures.
    pub fn rotate_to(&mut self, key_id: &str) -> Result<(), SigningError> {
        if !self.keys.contains_key(key_id) {
            return Err(SigningError::UnknownKey(key_id.to_string()));
        }
        self.active_key_id = Some(key_id.to_string());
        tracing::info!(key_id, "rotated active event signing key");
        Ok(())
    }

    pub fn active_key_id(&self) -> Option<&str> {
        self.active_key_id.as_deref()
    }

    /// Build a new event and sign it with the active key.
    pub fn sign(
        &self,
        event_type: &str,
        payload: Value,
        publisher_id: &str,
        correlation_id: Option<String>,
    ) -> Result<SignedEvent, SigningError> {
        let key_id = self
            .active_key_id
            .as_deref()
            .ok_or(SigningError::NoActiveKey)?;
        let secret = self.secret(key_id)?;

        let mut event = SignedEvent {
            id: Uuid::now_v7(),
            event_type: event_type.to_string(),
            payload,
            publisher_id: publisher_id.to_string(),
            correlation_id,
            timestamp: Utc::now(),
            signature: String::new(),
            key_id: key_id.to_string(),
        };
        event.signature = compute_hmac_sha256_hex(secret, &event.canonical_bytes())?;
        Ok(event)
    }

    /// Verify `event.signature` against the key named by `event.key_id`.
    pub fn verify(&self, event: &SignedEvent) -> Result<(), SigningError> {
        let secret = self.secret(&event.key_id)?;
        let expected = hex_decode(&event.signature).map_err(|_| SigningError::MalformedSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        mac.update(&event.canonical_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| SigningError::VerificationFailed)
    }

    fn secret(&self, key_id: &str) -> Result<&[u8], SigningError> {
        self.keys
            .get(key_id)
            .map(|secret| secret.expose_secret().as_bytes())
            .ok_or_else(|| SigningError::UnknownKey(key_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Hex helpers
// ---------------------------------------------------------------------------

/// Decode a lowercase hex string. Uppercase digits are rejected so a
/// signature has exactly one accepted spelling.
fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 || hex.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .ok_or(())
                .and_then(|pair| u8::from_str_radix(pair, 16).map_err(|_| ()))
        })
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// HMAC-SHA256 of `body`, lowercase hex.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
