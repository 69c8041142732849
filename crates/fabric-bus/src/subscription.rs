//! # Subscriptions
//!
//! A subscription binds a topic pattern (plus optional payload filter and
//! consumer group) to a handler. `subscribe` returns a handle whose
//! `unsubscribe()` is idempotent: it stops future dispatch but never
//! cancels handler invocations already in flight.

use crate::error::SubscribeError;
use async_trait::async_trait;
use fabric_types::{Message, MessageFilter, TopicPattern};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a message handler. Treated by the broker as an
/// implicit `nack(message_id, requeue)`.
#[derive(Debug, Error, Clone)]
#[error("Handler failed: {reason}")]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Consumer callback invoked once per delivery attempt.
///
/// Under at-least-once delivery the same message id may be seen more than
/// once; handlers must be idempotent or dedupe by `message.id`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. `Ok` acknowledges it; `Err` requeues it.
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What a subscription listens to and how it is delivered.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    /// Pattern matched against concrete channel names.
    pub channel_pattern: TopicPattern,
    /// Optional payload filter; a mismatch silently skips the delivery.
    pub filter: Option<MessageFilter>,
    /// Consumer group for competing-consumer load balancing.
    pub group: Option<String>,
    /// Concurrent handler invocations allowed for this subscription.
    pub max_concurrency: usize,
}

impl SubscriptionSpec {
    /// Parse a pattern into a spec with defaults (no filter, no group,
    /// one handler at a time).
    ///
    /// # Errors
    ///
    /// Returns the pattern parse failure.
    pub fn new(pattern: &str) -> Result<Self, SubscribeError> {
        Ok(Self {
            channel_pattern: TopicPattern::parse(pattern)?,
            filter: None,
            group: None,
            max_concurrency: 1,
        })
    }

    /// Constrain deliveries to payloads matching `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Filter on a single dotted path / expected value pair.
    #[must_use]
    pub fn with_filter_entry(mut self, path: impl Into<String>, expected: Value) -> Self {
        let filter = self.filter.take().unwrap_or_default().with(path, expected);
        self.filter = Some(filter);
        self
    }

    /// Join a consumer group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Allow up to `n` concurrent handler invocations.
    #[must_use]
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Validate filter paths and concurrency bounds.
    ///
    /// # Errors
    ///
    /// - `SubscribeError::Filter` for an invalid filter path
    /// - `SubscribeError::InvalidConcurrency` when `max_concurrency == 0`
    pub fn validate(&self) -> Result<(), SubscribeError> {
        if self.max_concurrency == 0 {
            return Err(SubscribeError::InvalidConcurrency);
        }
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        Ok(())
    }

    /// True when this spec would deliver `message` published on `channel`.
    #[must_use]
    pub fn accepts(&self, channel: &str, message: &Message) -> bool {
        self.channel_pattern.matches(channel)
            && self
                .filter
                .as_ref()
                .is_none_or(|f| f.matches(&message.payload))
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle does NOT unsubscribe - a subscription is live until
/// `unsubscribe()` is called, matching the explicit lifecycle of the
/// fabric. Call sites that want scoped subscriptions keep the handle and
/// unsubscribe on teardown.
pub struct SubscriptionHandle {
    id: Uuid,
    active: Arc<AtomicBool>,
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl SubscriptionHandle {
    /// Construct a handle. Broker implementations call this; consumers
    /// only receive handles from `subscribe`.
    #[must_use]
    pub fn new(id: Uuid, active: Arc<AtomicBool>, remove: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self { id, active, remove }
    }

    /// The subscription's id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// True until `unsubscribe` is called (here or on the broker).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop future dispatch. Idempotent; in-flight handler invocations run
    /// to completion or ack timeout.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            (self.remove)();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
