//! # Bus Events
//!
//! Typed notification stream for broker observers. Components subscribe to
//! a bounded broadcast channel of `BusEvent` values instead of registering
//! callbacks; a lagging observer drops the oldest events, never blocks the
//! broker.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// All events a broker emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusEvent {
    /// A message passed validation and was accepted for delivery.
    MessagePublished {
        channel: String,
        message_id: Uuid,
    },

    /// A delivery was acknowledged.
    MessageAcknowledged {
        channel: String,
        message_id: Uuid,
        subscription_id: Uuid,
    },

    /// A failed delivery was scheduled for redelivery.
    MessageRetryScheduled {
        channel: String,
        message_id: Uuid,
        /// 1-based attempt number that just failed.
        attempt: u32,
        delay_ms: u64,
    },

    /// A message exhausted its retries or was nacked without requeue.
    MessageDeadLettered {
        channel: String,
        dlq_channel: String,
        message_id: Uuid,
        reason: String,
    },

    /// A subscription was registered.
    SubscriptionCreated {
        subscription_id: Uuid,
        pattern: String,
        group: Option<String>,
    },

    /// A subscription was removed.
    SubscriptionRemoved { subscription_id: Uuid },

    /// A channel and its bound subscriptions were removed.
    ChannelDeleted { name: String },

    /// A broker-internal failure that was retried or absorbed, never
    /// propagated to publishers.
    Error { detail: String },
}

impl BusEvent {
    /// Short tag for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessagePublished { .. } => "message_published",
            Self::MessageAcknowledged { .. } => "message_acknowledged",
            Self::MessageRetryScheduled { .. } => "message_retry_scheduled",
            Self::MessageDeadLettered { .. } => "message_dead_lettered",
            Self::SubscriptionCreated { .. } => "subscription_created",
            Self::SubscriptionRemoved { .. } => "subscription_removed",
            Self::ChannelDeleted { .. } => "channel_deleted",
            Self::Error { .. } => "error",
        }
    }
}
