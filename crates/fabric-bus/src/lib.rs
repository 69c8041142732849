//! # Fabric Bus - In-Process Message Broker
//!
//! The core publish/subscribe engine of the messaging fabric:
//!
//! ```text
//! ┌──────────────┐                        ┌──────────────┐
//! │  Publisher   │                        │  Subscriber  │
//! │              │    publish()           │   handler    │
//! │              │ ──────┐                └──────────────┘
//! └──────────────┘       │                        ↑
//!                        ▼                        │ dispatch (FIFO
//!                  ┌──────────────┐               │  per channel)
//!                  │    Broker    │ ──────────────┘
//!                  │  (registry,  │
//!                  │   ack/nack,  │ ──► retry w/ backoff ──► <channel>.dlq
//!                  │   groups)    │
//!                  └──────────────┘
//! ```
//!
//! - Channels are validated and registered in the [`ChannelRegistry`];
//!   subscriptions match them through the shared topic-pattern matcher.
//! - Delivery is asynchronous: `publish` returns once the message is
//!   accepted, handlers run on worker tasks bounded by `max_concurrency`.
//! - A handler error is an implicit `nack(id, requeue)`; exhausted retries
//!   route the message, unmodified, to `<channel>.dlq`.
//! - All notification is via the typed [`BusEvent`] broadcast stream -
//!   there is no implicit global listener registry.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod backoff;
pub mod broker;
pub mod error;
pub mod events;
pub mod memory;
pub mod registry;
pub mod subscription;

// Re-export main types
pub use backoff::BackoffPolicy;
pub use broker::{Broker, BrokerStats, HealthStatus};
pub use error::{AckError, PublishError, SubscribeError};
pub use events::BusEvent;
pub use memory::{BrokerConfig, InMemoryBroker};
pub use registry::ChannelRegistry;
pub use subscription::{
    handler_fn, HandlerError, MessageHandler, SubscriptionHandle, SubscriptionSpec,
};

/// Events buffered per observer before lagging drops the oldest.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Last-resort dead-letter channel, used when a per-channel DLQ cannot be
/// registered.
pub const GLOBAL_DLQ_CHANNEL: &str = "fabric.dlq";

/// System broadcast channel seeded at broker startup.
pub const SYSTEM_BROADCAST_CHANNEL: &str = "agents.broadcast.system";
