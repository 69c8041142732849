//! # Fabric Transport - Durable Log-Backed Broker
//!
//! Implements the fabric's [`Broker`](fabric_bus::Broker) interface over an
//! append-only event log with consumer-group cursors, giving
//! **at-least-once** delivery across process restarts and multiple broker
//! instances. Broker instances coordinate only through the store's group
//! cursors - there is no broker-to-broker RPC.
//!
//! ```text
//!  publish ──► batcher ──► EventLog (append-only, offset-ordered)
//!                               │
//!                  group cursor ▼ read
//!             ┌── consumer group poll loop ──► handler (ack advances
//!             │                                 the committed cursor)
//!             └── crash before ack ⇒ redelivery to another member
//! ```
//!
//! - Writes are batched (size/timeout flush) through a connection pool;
//!   `publish` returns only after its batch is durably appended.
//! - Each consumer group owns an independent cursor; explicit
//!   acknowledgment advances the contiguous committed prefix, which is
//!   what the store persists.
//! - Redelivery under at-least-once means consumers must be idempotent or
//!   dedupe by `message.id` - a documented contract, not enforced here.
//!
//! ## Layout
//!
//! Hexagonal: `ports` declares the driven [`EventLog`] port, `adapters`
//! provides the in-memory and file-backed implementations, `domain` holds
//! config and errors, `service` is the broker itself.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

// Re-export main types
pub use adapters::file::FileEventLog;
pub use adapters::memory::InMemoryEventLog;
pub use domain::config::TransportConfig;
pub use domain::errors::{StoreError, TransportError};
pub use ports::outbound::{EventLog, LogEntry, SequencedEntry};
pub use service::{DurableBroker, LatencySnapshot, TransportMetrics};
