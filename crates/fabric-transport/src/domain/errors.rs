//! Transport error types.

use thiserror::Error;

/// Failures reported by an [`crate::EventLog`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached right now. Transient; retried with
    /// backoff by the transport.
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A read or write failed at the I/O layer.
    #[error("Store I/O failure: {reason}")]
    Io { reason: String },

    /// A log record could not be decoded.
    #[error("Corrupt log record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// Another process holds the store's writer lock.
    #[error("Log store is locked by another writer")]
    Locked,
}

/// Failures internal to the transport service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored message could not be (de)serialized.
    #[error("Codec failure: {reason}")]
    Codec { reason: String },
}
