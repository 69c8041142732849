//! # Adapters
//!
//! [`EventLog`](crate::EventLog) implementations: an in-memory log with
//! fault injection for tests and a crash-safe file-backed log for
//! single-node durability.

pub mod file;
pub mod memory;
