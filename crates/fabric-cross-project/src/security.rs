//! # Envelope Security
//!
//! The single implementation of envelope signing and verification used by
//! every project boundary.
//!
//! ## Security Properties
//!
//! - **HMAC-SHA256 signatures** over payload + timestamp + nonce, keyed by
//!   the source project's secret; verification uses constant-time
//!   comparison
//! - **Time-bounded validity**: envelopes expire after 60 seconds, with
//!   10 seconds of forward clock skew allowed
//! - **Nonce replay prevention**: a nonce is accepted once within the
//!   validity window and garbage-collected afterwards

use fabric_types::{CrossProjectMessage, EnvelopePayload, EnvelopeSecurity};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew for future timestamps (seconds).
pub const MAX_FUTURE_SKEW: u64 = 10;

/// Maximum age for valid timestamps (seconds).
pub const MAX_AGE: u64 = 60;

/// Duration to retain nonces (2x the validity window).
pub const NONCE_CACHE_TTL: Duration = Duration::from_secs(120);

/// Maximum nonce cache size before forced cleanup.
pub const MAX_NONCE_CACHE_SIZE: usize = 100_000;

/// Why an envelope failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyFailure {
    /// Timestamp outside `now - 60s ..= now + 10s`.
    TimestampOutOfRange { timestamp: u64, now: u64 },
    /// Nonce seen before within its validity window.
    ReplayDetected { nonce: Uuid },
    /// Signature mismatch.
    BadSignature,
}

/// Current Unix timestamp in seconds. Never panics; a pre-epoch clock
/// reads as zero.
#[must_use]
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sign an envelope payload, producing the security section.
#[must_use]
pub fn sign_envelope(payload: &EnvelopePayload, secret: &[u8]) -> EnvelopeSecurity {
    let timestamp = current_timestamp();
    let nonce = Uuid::new_v4();
    let bytes = CrossProjectMessage::signable_bytes(payload, timestamp, nonce);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(&bytes);
    let signature = hex_encode(&mac.finalize().into_bytes());

    EnvelopeSecurity {
        signature,
        timestamp,
        nonce,
    }
}

/// Verify an envelope's signature, timestamp window, and nonce freshness.
///
/// # Errors
///
/// Returns the first failed check, in order: timestamp, nonce, signature.
pub fn verify_envelope(
    envelope: &CrossProjectMessage,
    secret: &[u8],
    nonces: &NonceCache,
) -> Result<(), VerifyFailure> {
    let now = current_timestamp();
    let timestamp = envelope.security.timestamp;

    if timestamp + MAX_AGE < now || timestamp > now + MAX_FUTURE_SKEW {
        return Err(VerifyFailure::TimestampOutOfRange { timestamp, now });
    }

    if !nonces.check_and_insert(envelope.security.nonce) {
        return Err(VerifyFailure::ReplayDetected {
            nonce: envelope.security.nonce,
        });
    }

    let bytes =
        CrossProjectMessage::signable_bytes(&envelope.payload, timestamp, envelope.security.nonce);
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(&bytes);

    let Some(signature) = hex_decode(&envelope.security.signature) else {
        return Err(VerifyFailure::BadSignature);
    };
    // Constant-time comparison.
    mac.verify_slice(&signature)
        .map_err(|_| VerifyFailure::BadSignature)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Thread-safe nonce cache for replay prevention.
///
/// Tracks seen nonces with their expiry; expired entries are evicted when
/// the cache grows past its bound.
#[derive(Debug, Default)]
pub struct NonceCache {
    cache: RwLock<HashMap<Uuid, Instant>>,
}

impl NonceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a nonce and record it.
    ///
    /// Returns `true` for a fresh nonce, `false` for a replay.
    pub fn check_and_insert(&self, nonce: Uuid) -> bool {
        let now = Instant::now();
        let expiry = now + NONCE_CACHE_TTL;

        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            // A poisoned cache still prevents replays after recovery.
            Err(poisoned) => poisoned.into_inner(),
        };

        if cache.len() >= MAX_NONCE_CACHE_SIZE {
            cache.retain(|_, exp| *exp > now);
        }

        if let Some(&exp) = cache.get(&nonce) {
            if exp > now {
                return false;
            }
        }

        cache.insert(nonce, expiry);
        true
    }

    /// Number of cached nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    /// True when the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
