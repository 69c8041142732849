//! # Broker Abstraction
//!
//! The object-safe interface shared by the in-process broker and the
//! durable transport. Collaborators (agent runtimes, the cross-project
//! layer, operator tooling) hold an `Arc<dyn Broker>` - brokers are always
//! constructed explicitly and passed by reference, never reached through
//! module-level state.

use crate::error::{AckError, PublishError, SubscribeError};
use crate::events::BusEvent;
use crate::registry::ChannelRegistry;
use crate::subscription::{MessageHandler, SubscriptionHandle, SubscriptionSpec};
use async_trait::async_trait;
use fabric_types::{ChannelError, Message};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Coarse broker health, derived from store connectivity and error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Accepting and delivering normally.
    Healthy,
    /// Delivering, but with elevated failures; callers should back off.
    Degraded,
    /// Store unreachable beyond the grace period; callers must failover.
    Unhealthy,
}

/// Counter snapshot for a broker instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Handler invocations started.
    pub delivered: u64,
    /// Deliveries acknowledged.
    pub acknowledged: u64,
    /// Deliveries that failed (handler error or explicit nack).
    pub failed: u64,
    /// Redeliveries scheduled.
    pub retried: u64,
    /// Messages routed to a dead-letter channel.
    pub dead_lettered: u64,
    /// Deliveries currently awaiting acknowledgment.
    pub in_flight: u64,
    /// Live subscriptions.
    pub active_subscriptions: u64,
}

/// Publish/subscribe engine with acknowledgment bookkeeping.
#[async_trait]
pub trait Broker: Send + Sync {
    /// The channel registry backing this broker. Channel CRUD
    /// (`create`/`get`/`update`/`list`/`find_by_pattern`) goes through it;
    /// deletion goes through [`Broker::delete_channel`] so subscriptions
    /// cascade.
    fn channels(&self) -> Arc<ChannelRegistry>;

    /// Validate and accept a message for delivery on `channel`.
    ///
    /// Returns once the message is durably accepted; handler delivery is
    /// asynchronous. The returned id is the message id.
    ///
    /// # Errors
    ///
    /// `ChannelNotFound`, `InvalidMessage`, or `MessageTooLarge` -
    /// synchronously, per the validation taxonomy.
    async fn publish(&self, channel: &str, message: Message) -> Result<Uuid, PublishError>;

    /// Register a subscription and start dispatching matching messages to
    /// `handler`, FIFO per channel relative to publish order.
    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, SubscribeError>;

    /// Remove a subscription by id. Returns `false` when unknown (an
    /// unsubscribe is idempotent, not an error).
    async fn unsubscribe(&self, subscription_id: Uuid) -> bool;

    /// Acknowledge every pending delivery of a message.
    async fn acknowledge(&self, message_id: Uuid) -> Result<(), AckError>;

    /// Negatively acknowledge pending deliveries of a message.
    /// `requeue = true` schedules redelivery with backoff up to the
    /// channel's `max_retries`; `requeue = false` dead-letters immediately.
    async fn nack(&self, message_id: Uuid, requeue: bool) -> Result<(), AckError>;

    /// Delete a channel and remove all live subscriptions bound to it.
    async fn delete_channel(&self, name: &str) -> Result<(), ChannelError>;

    /// Counter snapshot.
    fn stats(&self) -> BrokerStats;

    /// Current health.
    fn status(&self) -> HealthStatus;

    /// Subscribe to the broker's typed event stream.
    fn events(&self) -> broadcast::Receiver<BusEvent>;
}
