//! # Fabric Types - Shared Domain Types for the OSSA Messaging Fabric
//!
//! Single Source of Truth for the types every fabric crate exchanges:
//!
//! - **Channels**: named pub/sub endpoints with a type and QoS policy
//! - **Topic patterns**: `*`/`#` wildcard matching against channel names
//! - **Messages**: the immutable unit of delivery, with an `ossa://` sender
//! - **Projects & contracts**: tenant policy for cross-project traffic
//! - **Envelope**: the signed wrapper for messages crossing project
//!   boundaries
//!
//! The grammar validators and the pattern matcher live here so that the
//! in-process broker, the durable transport, and the cross-project layer
//! all validate identically.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod channel;
pub mod envelope;
pub mod errors;
pub mod message;
pub mod pattern;
pub mod project;
pub mod rate_limiter;

// Re-export main types
pub use channel::{Channel, ChannelConfig, ChannelType, ChannelUpdate, DeliveryGuarantee, QosPolicy};
pub use envelope::{
    CrossProjectMessage, EnvelopePayload, EnvelopeSecurity, EnvelopeSource, EnvelopeTarget,
};
pub use errors::{ChannelError, FilterError, MessageError, PatternError};
pub use message::{Message, MessageFilter, MessageMetadata};
pub use pattern::TopicPattern;
pub use project::{
    ContractMetadata, CrossProjectEventContract, ProjectConfig, ProjectCredentials, RateLimitPolicy,
};
pub use rate_limiter::RateLimiter;

/// Scheme prefix for agent sender URIs.
pub const AGENT_URI_PREFIX: &str = "ossa://agents/";

/// Smallest permitted `max_message_size` (bytes).
pub const MIN_MESSAGE_SIZE: usize = 1024;

/// Largest permitted `max_message_size` (bytes).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on `qos.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 100;
