//! # OSSA Fabric Test Suite
//!
//! Unified test crate for cross-crate scenarios:
//!
//! ```text
//! tests/src/
//! └── integration/      # Cross-crate flows
//!     ├── channels.rs   # Channel model + pattern matching through the broker
//!     ├── pubsub.rs     # Publish/subscribe, filters, groups, ordering
//!     ├── reliability.rs# Retry, DLQ, ack timeout, unsubscribe semantics
//!     ├── durability.rs # Log-backed redelivery across broker restarts
//!     └── federation.rs # Cross-project authorization, signing, quotas
//! ```
//!
//! Single-crate behavior is covered by each crate's own `#[cfg(test)]`
//! modules; everything here exercises at least two crates together.
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p fabric-tests
//!
//! # By flow
//! cargo test -p fabric-tests integration::durability::
//! ```

#[cfg(test)]
mod integration;
