//! # In-Memory Broker
//!
//! Single-process implementation of [`Broker`]. Each subscription owns an
//! unbounded job queue drained by one worker task, which preserves FIFO
//! dispatch order per (channel, subscription) while a semaphore bounds
//! concurrent handler invocations at `max_concurrency`.
//!
//! Acknowledgment bookkeeping is per delivery: every enqueued delivery is
//! recorded in an in-flight table keyed by message id and settled exactly
//! once - by the handler result, by an explicit `acknowledge`/`nack`, or
//! by the ack-timeout sweeper. Failed deliveries retry with exponential
//! backoff up to the channel's `max_retries`, then route to
//! `<channel>.dlq`.

use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, BrokerStats, HealthStatus};
use crate::error::{AckError, PublishError, SubscribeError};
use crate::events::BusEvent;
use crate::registry::ChannelRegistry;
use crate::subscription::{MessageHandler, SubscriptionHandle, SubscriptionSpec};
use crate::{DEFAULT_EVENT_CAPACITY, GLOBAL_DLQ_CHANNEL, SYSTEM_BROADCAST_CHANNEL};
use async_trait::async_trait;
use dashmap::DashMap;
use fabric_types::{Channel, ChannelError, ChannelType, Message, QosPolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// Tuning knobs for the in-memory broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    /// Redelivery backoff schedule.
    pub backoff: BackoffPolicy,
    /// How often unacknowledged deliveries are checked against their
    /// ack deadline.
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            backoff: BackoffPolicy::default(),
            sweep_interval: Duration::from_millis(200),
        }
    }
}

/// One registered subscription.
struct SubscriptionEntry {
    id: Uuid,
    /// Registration order, used for stable round-robin group election.
    seq: u64,
    spec: SubscriptionSpec,
    handler: Arc<dyn MessageHandler>,
    active: Arc<AtomicBool>,
}

/// A queued delivery attempt.
struct Delivery {
    message: Message,
}

/// A delivery awaiting acknowledgment. `attempt` is 1-based.
#[derive(Clone)]
struct PendingDelivery {
    subscription_id: Uuid,
    /// Group of the subscription at enqueue time, kept so redelivery can
    /// re-elect after the original member unsubscribes.
    group: Option<String>,
    channel: String,
    qos: QosPolicy,
    message: Message,
    attempt: u32,
    deadline: Instant,
}

#[derive(Default)]
struct GroupState {
    members: Mutex<Vec<Uuid>>,
    cursor: AtomicUsize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

struct Inner {
    registry: Arc<ChannelRegistry>,
    subscriptions: DashMap<Uuid, Arc<SubscriptionEntry>>,
    senders: DashMap<Uuid, mpsc::UnboundedSender<Delivery>>,
    groups: DashMap<String, GroupState>,
    in_flight: DashMap<Uuid, Vec<PendingDelivery>>,
    events: broadcast::Sender<BusEvent>,
    counters: Counters,
    config: BrokerConfig,
    next_seq: AtomicU64,
}

/// In-process [`Broker`] implementation.
///
/// Must be constructed inside a Tokio runtime: the ack-timeout sweeper and
/// per-subscription workers are spawned tasks. The sweeper holds only a
/// weak reference, so dropping the last broker handle shuts everything
/// down.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a broker with its own empty channel registry.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_registry(Arc::new(ChannelRegistry::new()), config)
    }

    /// Create a broker over an existing registry.
    #[must_use]
    pub fn with_registry(registry: Arc<ChannelRegistry>, config: BrokerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new(Inner {
            registry,
            subscriptions: DashMap::new(),
            senders: DashMap::new(),
            groups: DashMap::new(),
            in_flight: DashMap::new(),
            events,
            counters: Counters::default(),
            config,
            next_seq: AtomicU64::new(0),
        });

        // The platform system broadcast exists from the first instant.
        let _ = inner.registry.ensure(Channel::new(
            SYSTEM_BROADCAST_CHANNEL,
            ChannelType::Broadcast,
        ));

        Inner::spawn_sweeper(&inner);
        Self { inner }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn channels(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.inner.registry)
    }

    async fn publish(&self, channel: &str, message: Message) -> Result<Uuid, PublishError> {
        let record = self
            .inner
            .registry
            .get(channel)
            .ok_or_else(|| ChannelError::NotFound {
                name: channel.to_string(),
            })?;

        let mut message = message;
        message.channel = channel.to_string();
        // Retry bookkeeping starts at zero regardless of what the
        // publisher put there.
        message.metadata.retry_count = 0;
        message.validate()?;
        message.check_size(record.config.max_message_size)?;

        let message_id = message.id;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.emit(BusEvent::MessagePublished {
            channel: channel.to_string(),
            message_id,
        });

        self.inner.dispatch(channel, &record.qos, &message);
        Ok(message_id)
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        spec.validate()?;

        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = Arc::new(SubscriptionEntry {
            id,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            spec: spec.clone(),
            handler,
            active: Arc::clone(&active),
        });

        self.inner.subscriptions.insert(id, Arc::clone(&entry));
        self.inner.senders.insert(id, tx);
        if let Some(group) = &spec.group {
            self.inner
                .groups
                .entry(group.clone())
                .or_default()
                .members
                .lock()
                .push(id);
        }

        Inner::spawn_worker(&self.inner, entry, rx);
        self.inner.emit(BusEvent::SubscriptionCreated {
            subscription_id: id,
            pattern: spec.channel_pattern.as_str().to_string(),
            group: spec.group.clone(),
        });

        let weak = Arc::downgrade(&self.inner);
        Ok(SubscriptionHandle::new(
            id,
            active,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove_subscription(id);
                }
            }),
        ))
    }

    async fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.inner.remove_subscription(subscription_id)
    }

    async fn acknowledge(&self, message_id: Uuid) -> Result<(), AckError> {
        let settled = self.inner.take_pending(message_id, None);
        if settled.is_empty() {
            return Err(AckError::UnknownMessage { message_id });
        }
        for state in settled {
            self.inner.record_ack(&state);
        }
        Ok(())
    }

    async fn nack(&self, message_id: Uuid, requeue: bool) -> Result<(), AckError> {
        let settled = self.inner.take_pending(message_id, None);
        if settled.is_empty() {
            return Err(AckError::UnknownMessage { message_id });
        }
        for state in settled {
            self.inner.handle_failure(state, requeue, "explicit nack");
        }
        Ok(())
    }

    async fn delete_channel(&self, name: &str) -> Result<(), ChannelError> {
        self.inner.registry.delete(name)?;

        let bound: Vec<Uuid> = self
            .inner
            .subscriptions
            .iter()
            .filter(|e| e.spec.channel_pattern.matches(name))
            .map(|e| e.id)
            .collect();
        for id in bound {
            self.inner.remove_subscription(id);
        }

        self.inner.emit(BusEvent::ChannelDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            in_flight: self
                .inner
                .in_flight
                .iter()
                .map(|v| v.len() as u64)
                .sum(),
            active_subscriptions: self.inner.subscriptions.len() as u64,
        }
    }

    fn status(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn emit(&self, event: BusEvent) {
        // No observers is normal; broadcast errors are not.
        let _ = self.events.send(event);
    }

    /// Fan a message out to matching subscriptions. Independent
    /// subscriptions each get a copy; a shared group elects exactly one
    /// member by round-robin over registration order.
    fn dispatch(self: &Arc<Self>, channel: &str, qos: &QosPolicy, message: &Message) {
        let mut independents: Vec<Arc<SubscriptionEntry>> = Vec::new();
        let mut grouped: HashMap<String, Vec<Arc<SubscriptionEntry>>> = HashMap::new();

        for entry_ref in self.subscriptions.iter() {
            let entry = Arc::clone(entry_ref.value());
            if !entry.active.load(Ordering::Acquire) || !entry.spec.accepts(channel, message) {
                continue;
            }
            match &entry.spec.group {
                Some(group) => grouped.entry(group.clone()).or_default().push(entry),
                None => independents.push(entry),
            }
        }

        for entry in independents {
            self.enqueue(&entry, channel, qos, message.clone(), 1);
        }
        for (group, mut members) in grouped {
            members.sort_by_key(|e| e.seq);
            if let Some(entry) = self.elect(&group, &members) {
                self.enqueue(&entry, channel, qos, message.clone(), 1);
            }
        }
    }

    fn elect(
        &self,
        group: &str,
        members: &[Arc<SubscriptionEntry>],
    ) -> Option<Arc<SubscriptionEntry>> {
        if members.is_empty() {
            return None;
        }
        let state = self.groups.get(group)?;
        let index = state.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
        Some(Arc::clone(&members[index]))
    }

    fn enqueue(
        self: &Arc<Self>,
        entry: &Arc<SubscriptionEntry>,
        channel: &str,
        qos: &QosPolicy,
        message: Message,
        attempt: u32,
    ) {
        let pending = PendingDelivery {
            subscription_id: entry.id,
            group: entry.spec.group.clone(),
            channel: channel.to_string(),
            qos: qos.clone(),
            message: message.clone(),
            attempt,
            deadline: Instant::now() + qos.ack_timeout,
        };
        self.in_flight
            .entry(message.id)
            .or_default()
            .push(pending);

        let message_id = message.id;
        let sent = self
            .senders
            .get(&entry.id)
            .map(|tx| tx.send(Delivery { message }).is_ok())
            .unwrap_or(false);

        if !sent {
            // Worker gone between match and send; nothing will settle it.
            let _ = self.take_pending(message_id, Some(entry.id));
        }
    }

    fn spawn_worker(
        inner: &Arc<Self>,
        entry: Arc<SubscriptionEntry>,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
    ) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(entry.spec.max_concurrency));
            while let Some(delivery) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };

                if !entry.active.load(Ordering::Acquire) {
                    let _ = inner.take_pending(delivery.message.id, Some(entry.id));
                    continue;
                }

                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                inner.counters.delivered.fetch_add(1, Ordering::Relaxed);

                let entry = Arc::clone(&entry);
                let weak = Arc::downgrade(&inner);
                drop(inner);
                tokio::spawn(async move {
                    let _permit = permit;
                    let message_id = delivery.message.id;
                    let result = entry.handler.handle(delivery.message).await;
                    let Some(inner) = weak.upgrade() else { return };
                    match result {
                        Ok(()) => {
                            for state in inner.take_pending(message_id, Some(entry.id)) {
                                inner.record_ack(&state);
                            }
                        }
                        Err(error) => {
                            for state in inner.take_pending(message_id, Some(entry.id)) {
                                inner.handle_failure(state, true, &error.to_string());
                            }
                        }
                    }
                });
            }
            debug!(subscription = %entry.id, "Subscription worker stopped");
        });
    }

    fn spawn_sweeper(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let interval = inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.sweep_expired();
            }
        });
    }

    /// Treat deliveries past their ack deadline as failed.
    fn sweep_expired(self: &Arc<Self>) {
        let now = Instant::now();
        let keys: Vec<Uuid> = self.in_flight.iter().map(|e| *e.key()).collect();
        for message_id in keys {
            let mut expired = Vec::new();
            if let Some(mut entry) = self.in_flight.get_mut(&message_id) {
                let states = std::mem::take(entry.value_mut());
                let (hit, keep): (Vec<_>, Vec<_>) =
                    states.into_iter().partition(|s| s.deadline <= now);
                *entry.value_mut() = keep;
                expired = hit;
            }
            self.in_flight.remove_if(&message_id, |_, v| v.is_empty());
            for state in expired {
                warn!(
                    message_id = %message_id,
                    subscription = %state.subscription_id,
                    "Delivery unacknowledged past ack_timeout"
                );
                self.handle_failure(state, true, "ack timeout");
            }
        }
    }

    /// Remove pending deliveries for a message, optionally scoped to one
    /// subscription. Settling is exactly-once: a delivery removed here is
    /// never settled again by another path.
    fn take_pending(&self, message_id: Uuid, only: Option<Uuid>) -> Vec<PendingDelivery> {
        let mut taken = Vec::new();
        if let Some(mut entry) = self.in_flight.get_mut(&message_id) {
            let states = std::mem::take(entry.value_mut());
            let (hit, keep): (Vec<_>, Vec<_>) = states
                .into_iter()
                .partition(|s| only.is_none_or(|sub| s.subscription_id == sub));
            *entry.value_mut() = keep;
            taken = hit;
        }
        self.in_flight.remove_if(&message_id, |_, v| v.is_empty());
        taken
    }

    fn record_ack(&self, state: &PendingDelivery) {
        self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
        self.emit(BusEvent::MessageAcknowledged {
            channel: state.channel.clone(),
            message_id: state.message.id,
            subscription_id: state.subscription_id,
        });
    }

    /// Route a failed delivery: redeliver with backoff while attempts
    /// remain, otherwise dead-letter.
    fn handle_failure(self: &Arc<Self>, state: PendingDelivery, requeue: bool, reason: &str) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        if requeue && state.attempt < state.qos.max_retries {
            let delay = self.config.backoff.delay_for(state.attempt.saturating_sub(1));
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            self.emit(BusEvent::MessageRetryScheduled {
                channel: state.channel.clone(),
                message_id: state.message.id,
                attempt: state.attempt,
                delay_ms: delay.as_millis() as u64,
            });

            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else { return };
                inner.redeliver(state);
            });
        } else {
            self.dead_letter(&state, reason);
        }
    }

    fn redeliver(self: &Arc<Self>, mut state: PendingDelivery) {
        // Prefer the original subscription; fall back to re-electing a
        // group member so a departed consumer does not strand the message.
        let target = self
            .subscriptions
            .get(&state.subscription_id)
            .map(|e| Arc::clone(e.value()))
            .filter(|e| e.active.load(Ordering::Acquire))
            .or_else(|| self.reelect_group_member(&state));

        match target {
            Some(entry) => {
                state.message.metadata.retry_count = state.attempt;
                self.enqueue(
                    &entry,
                    &state.channel,
                    &state.qos,
                    state.message,
                    state.attempt + 1,
                );
            }
            None => {
                debug!(
                    message_id = %state.message.id,
                    "Redelivery target gone; dropping delivery"
                );
            }
        }
    }

    fn reelect_group_member(&self, state: &PendingDelivery) -> Option<Arc<SubscriptionEntry>> {
        let group = state.group.as_deref()?;

        let mut members: Vec<Arc<SubscriptionEntry>> = self
            .subscriptions
            .iter()
            .filter(|e| {
                e.active.load(Ordering::Acquire)
                    && e.spec.group.as_deref() == Some(group)
                    && e.spec.accepts(&state.channel, &state.message)
            })
            .map(|e| Arc::clone(e.value()))
            .collect();
        members.sort_by_key(|e| e.seq);
        self.elect(group, &members)
    }

    fn dead_letter(self: &Arc<Self>, state: &PendingDelivery, reason: &str) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);

        if state.channel.ends_with(".dlq") {
            // Never dead-letter a dead letter.
            self.emit(BusEvent::Error {
                detail: format!(
                    "delivery of {} failed on dead-letter channel {}: {reason}",
                    state.message.id, state.channel
                ),
            });
            return;
        }

        let dlq_name = format!("{}.dlq", state.channel);
        let dlq = self
            .registry
            .ensure(Channel::new(dlq_name.clone(), ChannelType::Topic))
            .or_else(|_| {
                self.registry
                    .ensure(Channel::new(GLOBAL_DLQ_CHANNEL, ChannelType::Topic))
            });

        let Ok(dlq) = dlq else {
            self.emit(BusEvent::Error {
                detail: format!("no dead-letter channel available for {}", state.channel),
            });
            return;
        };

        warn!(
            message_id = %state.message.id,
            channel = %state.channel,
            dlq = %dlq.name,
            reason,
            "Message dead-lettered"
        );
        self.emit(BusEvent::MessageDeadLettered {
            channel: state.channel.clone(),
            dlq_channel: dlq.name.clone(),
            message_id: state.message.id,
            reason: reason.to_string(),
        });

        // The message is forwarded unmodified; only the dispatch channel
        // changes.
        self.dispatch(&dlq.name, &dlq.qos, &state.message);
    }

    fn remove_subscription(&self, id: Uuid) -> bool {
        let Some((_, entry)) = self.subscriptions.remove(&id) else {
            return false;
        };
        entry.active.store(false, Ordering::Release);
        self.senders.remove(&id);
        if let Some(group) = &entry.spec.group {
            if let Some(state) = self.groups.get(group) {
                state.members.lock().retain(|m| *m != id);
            }
        }
        self.emit(BusEvent::SubscriptionRemoved {
            subscription_id: id,
        });
        true
    }
}
