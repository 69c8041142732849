//! # Outbound Ports (Driven Ports)
//!
//! The storage interface the durable broker requires. Production deploys a
//! replicated stream store behind this trait; the in-crate adapters cover
//! single-node durability (file log) and testing (in-memory log).

use crate::domain::errors::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One record to append: the dispatch channel plus the serialized message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Channel the record is dispatched on.
    pub channel: String,
    /// Serialized [`fabric_types::Message`] (JSON).
    pub payload: Vec<u8>,
}

/// A stored record with its assigned offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEntry {
    /// Position in the log. Offsets are dense and strictly increasing.
    pub offset: u64,
    /// The record.
    pub entry: LogEntry,
}

/// Abstract append-only log with named consumer-group cursors.
///
/// ## Contract
///
/// - `append_batch` is atomic: either every entry is appended, in order,
///   or none are.
/// - Offsets are assigned densely starting at 0.
/// - A stored cursor is the first offset a group has NOT fully processed;
///   everything below it is acknowledged and never redelivered.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Append entries atomically. Returns the offset of the first entry.
    async fn append_batch(&self, entries: Vec<LogEntry>) -> Result<u64, StoreError>;

    /// Read up to `max` entries starting at `offset` (inclusive).
    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<SequencedEntry>, StoreError>;

    /// One past the last appended offset; 0 for an empty log.
    async fn next_offset(&self) -> Result<u64, StoreError>;

    /// The persisted cursor for a group, if any.
    async fn load_cursor(&self, group: &str) -> Result<Option<u64>, StoreError>;

    /// Persist a group cursor.
    async fn store_cursor(&self, group: &str, offset: u64) -> Result<(), StoreError>;

    /// Connectivity probe used by health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}
