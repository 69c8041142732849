//! # Fabric Cross-Project Layer
//!
//! Routes messages between projects (tenants) on top of a
//! [`Broker`](fabric_bus::Broker):
//!
//! - **Registry**: projects and event contracts; a triple
//!   `(source, target, event_type)` is deliverable only when project
//!   policy AND a registered contract both allow it
//! - **Security**: envelopes are HMAC-SHA256 signed over
//!   payload + timestamp + nonce with the source project's secret, and
//!   verified against a time-bounded nonce cache (replay prevention)
//! - **Quota**: a token bucket per project bounds sustained and burst
//!   send rates; a rejected send has no side effects
//! - **Delivery**: envelopes are published on the target-namespaced
//!   channel `<namespace>.<event_type>` and consumed by the per-project
//!   consumer group `project-<id>`
//!
//! Agents never construct envelopes themselves; this layer is the only
//! producer.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod error;
pub mod registry;
pub mod router;
pub mod security;

pub use error::CrossProjectError;
pub use registry::{ContractRegistry, ProjectRegistry};
pub use router::{
    CrossProjectRouter, CrossProjectStats, HandlerOptions, SendOptions, ValidationReport,
};
pub use security::{sign_envelope, verify_envelope, NonceCache};

/// Consumer-group prefix for per-project handlers.
pub const PROJECT_GROUP_PREFIX: &str = "project-";
