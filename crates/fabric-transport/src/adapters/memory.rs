//! In-memory event log.
//!
//! The testing adapter: offset-ordered entries in a `Vec`, cursors in a
//! map, and a connectivity switch so tests can drive the transport's
//! degraded/unhealthy paths.

use crate::domain::errors::StoreError;
use crate::ports::outbound::{EventLog, LogEntry, SequencedEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Volatile [`EventLog`] for tests and single-process setups that do not
/// need restart durability.
#[derive(Debug)]
pub struct InMemoryEventLog {
    entries: RwLock<Vec<LogEntry>>,
    cursors: DashMap<String, u64>,
    connected: AtomicBool,
}

impl InMemoryEventLog {
    /// Create an empty, connected log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cursors: DashMap::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Fault injection: flip store connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_connected(&self) -> Result<(), StoreError> {
        // Fault injection hook for the degraded/unhealthy paths.
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: "connection refused".to_string(),
            })
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append_batch(&self, entries: Vec<LogEntry>) -> Result<u64, StoreError> {
        self.check_connected()?;
        let mut store = self.entries.write();
        let first = store.len() as u64;
        store.extend(entries);
        Ok(first)
    }

    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<SequencedEntry>, StoreError> {
        self.check_connected()?;
        let store = self.entries.read();
        let start = offset.min(store.len() as u64) as usize;
        Ok(store[start..]
            .iter()
            .take(max)
            .enumerate()
            .map(|(i, entry)| SequencedEntry {
                offset: (start + i) as u64,
                entry: entry.clone(),
            })
            .collect())
    }

    async fn next_offset(&self) -> Result<u64, StoreError> {
        self.check_connected()?;
        Ok(self.entries.read().len() as u64)
    }

    async fn load_cursor(&self, group: &str) -> Result<Option<u64>, StoreError> {
        self.check_connected()?;
        Ok(self.cursors.get(group).map(|c| *c))
    }

    async fn store_cursor(&self, group: &str, offset: u64) -> Result<(), StoreError> {
        self.check_connected()?;
        self.cursors.insert(group.to_string(), offset);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_connected()
    }
}
