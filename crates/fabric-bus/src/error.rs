//! Broker operation errors.
//!
//! Validation failures are rejected synchronously and never retried;
//! transient delivery failures are handled internally (retry, backoff,
//! dead-letter) and surface via [`crate::BusEvent`] and metrics instead.

use fabric_types::{ChannelError, FilterError, MessageError, PatternError};
use thiserror::Error;
use uuid::Uuid;

/// Errors from `publish`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The target channel is missing or the name is invalid.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The message failed validation or exceeds the channel size limit.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The durable store refused the message after internal retries.
    #[error("Durable store rejected the message: {reason}")]
    Store { reason: String },

    /// The broker is shutting down and no longer accepts messages.
    #[error("Broker closed")]
    Closed,
}

/// Errors from `subscribe`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The channel pattern failed to parse.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// The filter names an invalid payload path.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// `max_concurrency` must be at least 1.
    #[error("max_concurrency must be at least 1")]
    InvalidConcurrency,
}

/// Errors from `acknowledge`/`nack`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    /// No pending delivery exists for this message id.
    #[error("No pending delivery for message {message_id}")]
    UnknownMessage { message_id: Uuid },
}
