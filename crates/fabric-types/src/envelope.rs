//! # Cross-Project Envelope
//!
//! The wrapper for messages crossing project boundaries. Envelopes are
//! always produced by the cross-project layer - agents never construct
//! them directly.
//!
//! ## Security Properties
//!
//! - **HMAC-SHA256 signature** over payload + timestamp + nonce, keyed by
//!   the source project's secret
//! - **Time-bounded replay prevention**: nonces are valid only within the
//!   timestamp window and are rejected on reuse
//! - **Envelope-only identity**: `source.project_id` is the sole authority
//!   for the sender's tenant

use crate::message::MessageMetadata;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Originating tenant of a cross-project message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSource {
    /// Source project id.
    pub project_id: String,
    /// Source channel namespace.
    pub namespace: String,
    /// Fabric protocol version the sender spoke.
    pub version: String,
}

/// Destination tenant of a cross-project message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeTarget {
    /// Target project id.
    pub project_id: String,
    /// Target channel namespace.
    pub namespace: String,
}

/// Signing material and replay-prevention fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSecurity {
    /// Hex-encoded HMAC-SHA256 over the signable bytes.
    pub signature: String,
    /// Unix timestamp (seconds) when the envelope was signed.
    pub timestamp: u64,
    /// Unique nonce, valid once within the timestamp window.
    pub nonce: Uuid,
}

/// The business payload and its delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopePayload {
    /// Delivery metadata carried from the inner message.
    pub metadata: MessageMetadata,
    /// Opaque event data.
    pub data: Value,
}

/// A signed message envelope crossing a project boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossProjectMessage {
    /// Originating tenant.
    pub source: EnvelopeSource,
    /// Destination tenant.
    pub target: EnvelopeTarget,
    /// Event type the envelope carries.
    pub event_type: String,
    /// Payload section.
    pub payload: EnvelopePayload,
    /// Signature section.
    pub security: EnvelopeSecurity,
}

impl CrossProjectMessage {
    /// Current envelope protocol version.
    pub const CURRENT_VERSION: &'static str = "1.0";

    /// The bytes covered by the signature: canonical payload JSON,
    /// timestamp, and nonce. Source/target routing fields are bound in by
    /// the channel the envelope is published on.
    #[must_use]
    pub fn signable_bytes(payload: &EnvelopePayload, timestamp: u64, nonce: Uuid) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(payload).unwrap_or_default();
        bytes.extend_from_slice(&timestamp.to_be_bytes());
        bytes.extend_from_slice(nonce.as_bytes());
        bytes
    }
}
