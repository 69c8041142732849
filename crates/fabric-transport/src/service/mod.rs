//! # Durable Broker Service
//!
//! [`DurableBroker`] implements the fabric [`Broker`] trait over an
//! [`EventLog`]:
//!
//! - `publish` hands the serialized message to a batcher task and waits
//!   for its batch to be durably appended (size/timeout flush, bounded
//!   pipeline, store access through the connection pool one unit of work
//!   at a time)
//! - each consumer group runs a poll loop reading from its cursor; a
//!   subscription without a group gets a private `solo-<id>` group, the
//!   competing-consumers degenerate case
//! - acknowledgments advance the group's contiguous committed prefix,
//!   which is persisted; a crash before ack leaves the offset below the
//!   cursor and it is redelivered, preferring a different group member
//! - exhausted retries append the unmodified message to `<channel>.dlq`
//!   so dead letters survive restarts too

pub(crate) mod consumer;
pub(crate) mod latency;

use crate::domain::config::TransportConfig;
use crate::domain::errors::StoreError;
use crate::ports::outbound::{EventLog, LogEntry, SequencedEntry};
use crate::service::consumer::{GroupCursor, PendingAttempt};
use crate::service::latency::LatencyWindow;
pub use crate::service::latency::LatencySnapshot;
use async_trait::async_trait;
use dashmap::DashMap;
use fabric_bus::{
    AckError, Broker, BrokerStats, BusEvent, ChannelRegistry, HealthStatus, MessageHandler,
    PublishError, SubscribeError, SubscriptionHandle, SubscriptionSpec, GLOBAL_DLQ_CHANNEL,
    SYSTEM_BROADCAST_CHANNEL,
};
use fabric_pool::{
    PoolError, PoolGuard, PoolStats, PooledResource, Priority, ResourceFactory, ResourceManager,
    ResourcePool,
};
use fabric_telemetry::metrics as tm;
use fabric_types::{Channel, ChannelError, ChannelType, Message, QosPolicy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

/// A pooled handle onto the shared event log. Modeling store access as a
/// pool resource bounds the write pipeline and gives health checks and
/// utilization metrics for free.
pub struct LogConn {
    log: Arc<dyn EventLog>,
}

#[async_trait]
impl PooledResource for LogConn {
    async fn is_healthy(&self) -> bool {
        self.log.ping().await.is_ok()
    }

    async fn close(&self) {}
}

struct LogConnFactory {
    log: Arc<dyn EventLog>,
}

#[async_trait]
impl ResourceFactory<LogConn> for LogConnFactory {
    async fn create(&self) -> Result<LogConn, PoolError> {
        Ok(LogConn {
            log: Arc::clone(&self.log),
        })
    }
}

/// A publish waiting for durable acceptance.
struct BatchRequest {
    entry: LogEntry,
    ack: oneshot::Sender<Result<u64, StoreError>>,
}

struct DurableSubscription {
    id: Uuid,
    spec: SubscriptionSpec,
    handler: Arc<dyn MessageHandler>,
    active: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
}

struct GroupRuntime {
    name: String,
    members: Mutex<Vec<Arc<DurableSubscription>>>,
    cursor: tokio::sync::Mutex<GroupCursor>,
    rr: AtomicUsize,
    notify: Notify,
}

struct CacheEntry {
    message: Message,
    channel: String,
    qos: QosPolicy,
    acked: AtomicBool,
    inserted: Instant,
}

#[derive(Clone, PartialEq, Eq)]
struct AckKey {
    group: String,
    offset: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    store_errors: AtomicU64,
}

/// Rolled-up transport observability snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMetrics {
    pub published: u64,
    pub consumed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub store_errors: u64,
    /// Deliveries awaiting acknowledgment right now.
    pub in_flight: u64,
    /// Real sliding-window processing latency.
    pub latency: LatencySnapshot,
    /// Acknowledgments per second over the latency window.
    pub throughput_per_sec: f64,
    /// Failed fraction of all finished deliveries.
    pub error_rate: f64,
    /// Store connection pool gauges.
    pub pool: PoolStats,
    /// Entries currently held in the local cache.
    pub cached_entries: usize,
}

struct DurableInner {
    registry: Arc<ChannelRegistry>,
    pool: ResourcePool<LogConn>,
    config: TransportConfig,
    events: broadcast::Sender<BusEvent>,
    batch_tx: mpsc::Sender<BatchRequest>,
    groups: DashMap<String, Arc<GroupRuntime>>,
    sub_index: DashMap<Uuid, String>,
    pending_acks: DashMap<Uuid, Vec<AckKey>>,
    cache: DashMap<u64, CacheEntry>,
    counters: Counters,
    latency: LatencyWindow,
    store_failures: AtomicU32,
}

/// Durable, at-least-once [`Broker`] over an append-only event log.
///
/// Must be constructed inside a Tokio runtime; the batcher, cache
/// eviction, and consumer-group loops are spawned tasks holding weak
/// references, so dropping the last broker handle winds everything down.
#[derive(Clone)]
pub struct DurableBroker {
    inner: Arc<DurableInner>,
}

impl DurableBroker {
    /// Create a broker over `log` with its own registry and pool manager.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, config: TransportConfig) -> Self {
        let manager = ResourceManager::new(config.pool.max_size);
        Self::with_registry(log, Arc::new(ChannelRegistry::new()), config, manager)
    }

    /// Create a broker sharing an existing registry and pool manager.
    #[must_use]
    pub fn with_registry(
        log: Arc<dyn EventLog>,
        registry: Arc<ChannelRegistry>,
        config: TransportConfig,
        manager: Arc<ResourceManager>,
    ) -> Self {
        let (events, _) = broadcast::channel(fabric_bus::DEFAULT_EVENT_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(config.pipeline_depth.max(1));

        let pool = ResourcePool::new(
            "event-log",
            Arc::new(LogConnFactory {
                log: Arc::clone(&log),
            }),
            config.pool.clone(),
            manager,
        );

        let inner = Arc::new(DurableInner {
            registry,
            pool,
            events,
            batch_tx,
            groups: DashMap::new(),
            sub_index: DashMap::new(),
            pending_acks: DashMap::new(),
            cache: DashMap::new(),
            counters: Counters::default(),
            latency: LatencyWindow::new(Duration::from_secs(60), 4096),
            store_failures: AtomicU32::new(0),
            config,
        });

        let _ = inner.registry.ensure(Channel::new(
            SYSTEM_BROADCAST_CHANNEL,
            ChannelType::Broadcast,
        ));

        DurableInner::spawn_batcher(&inner, batch_rx);
        DurableInner::spawn_eviction(&inner);
        Self { inner }
    }

    /// Transport-specific metrics beyond the [`Broker::stats`] counters.
    #[must_use]
    pub fn metrics(&self) -> TransportMetrics {
        let inner = &self.inner;
        let c = &inner.counters;
        let consumed = c.consumed.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let finished = consumed + failed;

        let pool = inner.pool.stats();
        tm::TRANSPORT_POOL_UTILIZATION.set(pool.utilization);

        TransportMetrics {
            published: c.published.load(Ordering::Relaxed),
            consumed,
            failed,
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            in_flight: inner.in_flight_total(),
            latency: inner.latency.snapshot(),
            throughput_per_sec: inner.latency.rate_per_sec(),
            error_rate: if finished == 0 {
                0.0
            } else {
                failed as f64 / finished as f64
            },
            pool,
            cached_entries: inner.cache.len(),
        }
    }
}

#[async_trait]
impl Broker for DurableBroker {
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
        message.metadata.retry_count = 0;
        message.validate()?;
        message.check_size(record.config.max_message_size)?;

        let payload = serde_json::to_vec(&message).map_err(|e| PublishError::Store {
            reason: format!("encode: {e}"),
        })?;

        let (ack, accepted) = oneshot::channel();
        self.inner
            .batch_tx
            .send(BatchRequest {
                entry: LogEntry {
                    channel: channel.to_string(),
                    payload,
                },
                ack,
            })
            .await
            .map_err(|_| PublishError::Closed)?;

        // Durable acceptance: wait for the batch holding this entry.
        let offset = accepted
            .await
            .map_err(|_| PublishError::Closed)?
            .map_err(|e| PublishError::Store {
                reason: e.to_string(),
            })?;

        self.inner.cache.insert(
            offset,
            CacheEntry {
                message: message.clone(),
                channel: channel.to_string(),
                qos: record.qos.clone(),
                acked: AtomicBool::new(false),
                inserted: Instant::now(),
            },
        );

        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        tm::TRANSPORT_MESSAGES_PUBLISHED.inc();
        self.inner.emit(BusEvent::MessagePublished {
            channel: channel.to_string(),
            message_id: message.id,
        });
        self.inner.notify_groups();
        Ok(message.id)
    }

    async fn subscribe(
        &self,
        spec: SubscriptionSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        spec.validate()?;

        let id = Uuid::new_v4();
        let active = Arc::new(AtomicBool::new(true));
        let group_name = spec
            .group
            .clone()
            .unwrap_or_else(|| format!("solo-{id}"));
        let subscription = Arc::new(DurableSubscription {
            id,
            spec: spec.clone(),
            handler,
            active: Arc::clone(&active),
            semaphore: Arc::new(Semaphore::new(spec.max_concurrency)),
        });

        self.inner
            .join_group(&group_name, subscription)
            .await;
        self.inner.sub_index.insert(id, group_name);
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
        let keys = self
            .inner
            .pending_acks
            .remove(&message_id)
            .map(|(_, keys)| keys)
            .unwrap_or_default();
        if keys.is_empty() {
            return Err(AckError::UnknownMessage { message_id });
        }
        for key in keys {
            if let Some(group) = self.inner.group(&key.group) {
                self.inner.settle_ack(&group, key.offset, None).await;
            }
        }
        Ok(())
    }

    async fn nack(&self, message_id: Uuid, requeue: bool) -> Result<(), AckError> {
        let keys = self
            .inner
            .pending_acks
            .remove(&message_id)
            .map(|(_, keys)| keys)
            .unwrap_or_default();
        if keys.is_empty() {
            return Err(AckError::UnknownMessage { message_id });
        }
        for key in keys {
            let Some(group) = self.inner.group(&key.group) else {
                continue;
            };
            if requeue {
                self.inner
                    .settle_fail(&group, key.offset, "explicit nack")
                    .await;
            } else {
                let taken = { group.cursor.lock().await.fail_take(key.offset) };
                if taken.is_some() {
                    self.inner.note_attempt_failed();
                    self.inner
                        .dead_letter(&group, key.offset, "explicit nack without requeue")
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn delete_channel(&self, name: &str) -> Result<(), ChannelError> {
        self.inner.registry.delete(name)?;

        let mut bound = Vec::new();
        for group in self.inner.groups.iter() {
            for member in group.members.lock().iter() {
                if member.spec.channel_pattern.matches(name) {
                    bound.push(member.id);
                }
            }
        }
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
            acknowledged: c.consumed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight_total(),
            active_subscriptions: self.inner.sub_index.len() as u64,
        }
    }

    fn status(&self) -> HealthStatus {
        let failures = self.inner.store_failures.load(Ordering::Relaxed);
        if failures >= self.inner.config.unhealthy_after_failures {
            return HealthStatus::Unhealthy;
        }
        if failures > 0 {
            return HealthStatus::Degraded;
        }

        let consumed = self.inner.counters.consumed.load(Ordering::Relaxed);
        let failed = self.inner.counters.failed.load(Ordering::Relaxed);
        let finished = consumed + failed;
        // A handful of early failures should not flap the status.
        if finished >= 20 && failed as f64 / finished as f64 > self.inner.config.degraded_error_rate
        {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }
}

impl DurableInner {
    fn emit(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }

    fn group(&self, name: &str) -> Option<Arc<GroupRuntime>> {
        self.groups.get(name).map(|g| Arc::clone(&g))
    }

    fn notify_groups(&self) {
        for group in self.groups.iter() {
            group.notify.notify_one();
        }
    }

    fn in_flight_total(&self) -> u64 {
        self.pending_acks.iter().map(|v| v.len() as u64).sum()
    }

    fn note_store_ok(&self) {
        self.store_failures.store(0, Ordering::Relaxed);
    }

    fn note_store_failure(&self, error: &StoreError) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        tm::TRANSPORT_STORE_ERRORS.inc();
        self.emit(BusEvent::Error {
            detail: error.to_string(),
        });
    }

    fn note_attempt_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tm::TRANSPORT_MESSAGES_FAILED.inc();
        tm::TRANSPORT_MESSAGES_IN_FLIGHT.dec();
    }

    async fn acquire(&self, priority: Priority) -> Result<PoolGuard<LogConn>, StoreError> {
        self.pool
            .acquire(priority)
            .await
            .map_err(|e| StoreError::Unavailable {
                reason: e.to_string(),
            })
    }

    // =========================================================================
    // WRITE PATH
    // =========================================================================

    fn spawn_batcher(inner: &Arc<Self>, mut rx: mpsc::Receiver<BatchRequest>) {
        let weak = Arc::downgrade(inner);
        let batch_size = inner.config.batch_size.max(1);
        let batch_timeout = inner.config.batch_timeout;
        tokio::spawn(async move {
            loop {
                let Some(first) = rx.recv().await else { break };
                let mut batch = vec![first];

                let deadline = tokio::time::Instant::now() + batch_timeout;
                while batch.len() < batch_size {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(request)) => batch.push(request),
                        Ok(None) | Err(_) => break,
                    }
                }

                let Some(inner) = weak.upgrade() else { break };
                inner.flush_batch(batch).await;
            }
            debug!("Batcher stopped");
        });
    }

    /// Append a batch, retrying store failures with backoff before
    /// reporting the error back to every waiting publisher.
    async fn flush_batch(self: &Arc<Self>, batch: Vec<BatchRequest>) {
        let entries: Vec<LogEntry> = batch.iter().map(|r| r.entry.clone()).collect();

        let mut attempt: u32 = 0;
        let result = loop {
            let appended = match self.acquire(Priority::High).await {
                Ok(conn) => conn.log.append_batch(entries.clone()).await,
                Err(error) => Err(error),
            };

            match appended {
                Ok(first) => {
                    self.note_store_ok();
                    break Ok(first);
                }
                Err(error) => {
                    self.note_store_failure(&error);
                    attempt += 1;
                    if attempt >= self.config.store_retry_attempts.max(1) {
                        break Err(error);
                    }
                    let delay = self.config.backoff.delay_for(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Append failed; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        match result {
            Ok(first) => {
                for (index, request) in batch.into_iter().enumerate() {
                    let _ = request.ack.send(Ok(first + index as u64));
                }
            }
            Err(error) => {
                for request in batch {
                    let _ = request.ack.send(Err(error.clone()));
                }
            }
        }
    }

    // =========================================================================
    // READ / DELIVERY PATH
    // =========================================================================

    async fn join_group(self: &Arc<Self>, name: &str, subscription: Arc<DurableSubscription>) {
        if let Some(runtime) = self.group(name) {
            runtime.members.lock().push(subscription);
            runtime.notify.notify_one();
            return;
        }

        let start = self.initial_cursor(name).await;
        let runtime = Arc::new(GroupRuntime {
            name: name.to_string(),
            members: Mutex::new(vec![subscription]),
            cursor: tokio::sync::Mutex::new(GroupCursor::new(start)),
            rr: AtomicUsize::new(0),
            notify: Notify::new(),
        });

        use dashmap::mapref::entry::Entry;
        match self.groups.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                // Raced with another subscriber creating the group.
                let winner = Arc::clone(existing.get());
                if let Some(member) = runtime.members.lock().pop() {
                    winner.members.lock().push(member);
                }
                winner.notify.notify_one();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&runtime));
                Self::spawn_group_loop(self, runtime);
            }
        }
    }

    /// A new group resumes from its persisted cursor, or starts at the
    /// current end of the log (it sees only messages published after it).
    async fn initial_cursor(&self, group: &str) -> u64 {
        match self.acquire(Priority::Normal).await {
            Ok(conn) => match conn.log.load_cursor(group).await {
                Ok(Some(cursor)) => cursor,
                Ok(None) => conn.log.next_offset().await.unwrap_or(0),
                Err(error) => {
                    self.note_store_failure(&error);
                    0
                }
            },
            Err(error) => {
                self.note_store_failure(&error);
                0
            }
        }
    }

    fn spawn_group_loop(inner: &Arc<Self>, group: Arc<GroupRuntime>) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { break };

                // The runtime is retired once it leaves the group map.
                let current = inner.group(&group.name);
                if !current.is_some_and(|rt| Arc::ptr_eq(&rt, &group)) {
                    break;
                }

                inner.sweep_group(&group).await;

                let next = { group.cursor.lock().await.next_read() };
                let read = match inner.acquire(Priority::Normal).await {
                    Ok(conn) => conn.log.read_from(next, inner.config.read_batch).await,
                    Err(error) => Err(error),
                };

                match read {
                    Ok(entries) if entries.is_empty() => {
                        let poll = inner.config.poll_interval;
                        drop(inner);
                        tokio::select! {
                            () = group.notify.notified() => {}
                            () = tokio::time::sleep(poll) => {}
                        }
                    }
                    Ok(entries) => {
                        for entry in entries {
                            inner.deliver_entry(&group, entry).await;
                        }
                    }
                    Err(error) => {
                        inner.note_store_failure(&error);
                        let poll = inner.config.poll_interval;
                        drop(inner);
                        tokio::time::sleep(poll).await;
                    }
                }
            }
            debug!(group = %group.name, "Consumer group loop stopped");
        });
    }

    async fn deliver_entry(self: &Arc<Self>, group: &Arc<GroupRuntime>, sequenced: SequencedEntry) {
        let offset = sequenced.offset;
        {
            group.cursor.lock().await.advance_read_past(offset);
        }

        let Some((message, qos)) = self.materialize(&sequenced) else {
            self.emit(BusEvent::Error {
                detail: format!("undecodable record at offset {offset}; skipped"),
            });
            self.complete_offset(group, offset).await;
            return;
        };

        let Some(member) = self.select_member(group, &sequenced.entry.channel, &message, None)
        else {
            // Not addressed to this group; counts as processed for it.
            self.complete_offset(group, offset).await;
            return;
        };

        // FIFO per subscription: hold the member's concurrency permit
        // before reading further entries.
        let Ok(permit) = Arc::clone(&member.semaphore).acquire_owned().await else {
            return;
        };

        {
            group.cursor.lock().await.begin(
                offset,
                1,
                Instant::now() + qos.ack_timeout,
                member.id,
            );
        }
        self.cache.entry(offset).or_insert_with(|| CacheEntry {
            message: message.clone(),
            channel: sequenced.entry.channel.clone(),
            qos: qos.clone(),
            acked: AtomicBool::new(false),
            inserted: Instant::now(),
        });
        self.pending_acks
            .entry(message.id)
            .or_default()
            .push(AckKey {
                group: group.name.clone(),
                offset,
            });
        tm::TRANSPORT_MESSAGES_IN_FLIGHT.inc();

        self.run_handler(Arc::clone(group), member, message, offset, permit);
    }

    /// Decode a record, preferring the publish-side cache.
    fn materialize(&self, sequenced: &SequencedEntry) -> Option<(Message, QosPolicy)> {
        if let Some(cached) = self.cache.get(&sequenced.offset) {
            return Some((cached.message.clone(), cached.qos.clone()));
        }
        let message: Message = serde_json::from_slice(&sequenced.entry.payload).ok()?;
        let qos = self
            .registry
            .get(&sequenced.entry.channel)
            .map(|c| c.qos)
            .unwrap_or_default();
        Some((message, qos))
    }

    /// Choose a group member for a delivery: accepting members with free
    /// concurrency first, round-robin; otherwise round-robin over all
    /// accepting members.
    fn select_member(
        &self,
        group: &GroupRuntime,
        channel: &str,
        message: &Message,
        exclude: Option<Uuid>,
    ) -> Option<Arc<DurableSubscription>> {
        let members = group.members.lock();
        let accepting: Vec<Arc<DurableSubscription>> = members
            .iter()
            .filter(|m| {
                m.active.load(Ordering::Acquire)
                    && Some(m.id) != exclude
                    && m.spec.accepts(channel, message)
            })
            .map(Arc::clone)
            .collect();
        drop(members);

        let pick = |candidates: &[Arc<DurableSubscription>]| {
            if candidates.is_empty() {
                None
            } else {
                let index = group.rr.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(Arc::clone(&candidates[index]))
            }
        };

        let idle: Vec<Arc<DurableSubscription>> = accepting
            .iter()
            .filter(|m| m.semaphore.available_permits() > 0)
            .map(Arc::clone)
            .collect();
        pick(&idle).or_else(|| pick(&accepting)).or_else(|| {
            // As a last resort allow the excluded member back in rather
            // than stranding the delivery.
            exclude.and_then(|_| {
                self.select_member(group, channel, message, None)
            })
        })
    }

    fn run_handler(
        self: &Arc<Self>,
        group: Arc<GroupRuntime>,
        member: Arc<DurableSubscription>,
        message: Message,
        offset: u64,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let result = member.handler.handle(message).await;
            let Some(inner) = weak.upgrade() else { return };
            match result {
                Ok(()) => inner.settle_ack(&group, offset, Some(started)).await,
                Err(error) => inner.settle_fail(&group, offset, &error.reason).await,
            }
        });
    }

    // =========================================================================
    // SETTLEMENT
    // =========================================================================

    async fn settle_ack(
        self: &Arc<Self>,
        group: &Arc<GroupRuntime>,
        offset: u64,
        started: Option<Instant>,
    ) {
        let (was_pending, advanced) = {
            let mut cursor = group.cursor.lock().await;
            match cursor.fail_take(offset) {
                Some(_) => (true, cursor.complete(offset)),
                None => (false, false),
            }
        };
        if !was_pending {
            // Already settled by the sweeper or an explicit call.
            return;
        }

        self.counters.consumed.fetch_add(1, Ordering::Relaxed);
        tm::TRANSPORT_MESSAGES_CONSUMED.inc();
        tm::TRANSPORT_MESSAGES_IN_FLIGHT.dec();
        if let Some(started) = started {
            let elapsed = started.elapsed();
            self.latency.record(elapsed);
            tm::TRANSPORT_PROCESSING_DURATION.observe(elapsed.as_secs_f64());
        }

        if let Some(cached) = self.cache.get(&offset) {
            cached.acked.store(true, Ordering::Release);
            self.drop_ack_key(cached.message.id, group, offset);
            self.emit(BusEvent::MessageAcknowledged {
                channel: cached.channel.clone(),
                message_id: cached.message.id,
                subscription_id: Uuid::nil(),
            });
        }

        if advanced {
            self.persist_cursor(group).await;
        }
    }

    async fn settle_fail(self: &Arc<Self>, group: &Arc<GroupRuntime>, offset: u64, reason: &str) {
        let taken = { group.cursor.lock().await.fail_take(offset) };
        let Some(attempt) = taken else { return };
        self.note_attempt_failed();
        self.after_failure(group, offset, attempt, reason).await;
    }

    async fn after_failure(
        self: &Arc<Self>,
        group: &Arc<GroupRuntime>,
        offset: u64,
        failed: PendingAttempt,
        reason: &str,
    ) {
        let Some(cached) = self.cached(offset) else {
            self.emit(BusEvent::Error {
                detail: format!("failed delivery at offset {offset} lost its cached record"),
            });
            self.complete_offset(group, offset).await;
            return;
        };

        if failed.attempt < cached.2.max_retries {
            let delay = self.config.backoff.delay_for(failed.attempt.saturating_sub(1));
            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            self.emit(BusEvent::MessageRetryScheduled {
                channel: cached.1.clone(),
                message_id: cached.0.id,
                attempt: failed.attempt,
                delay_ms: delay.as_millis() as u64,
            });

            let weak = Arc::downgrade(self);
            let group = Arc::clone(group);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else { return };
                inner.redeliver(&group, offset, failed).await;
            });
        } else {
            debug!(offset, reason, "Retries exhausted");
            self.dead_letter(group, offset, reason).await;
        }
    }

    async fn redeliver(self: &Arc<Self>, group: &Arc<GroupRuntime>, offset: u64, prev: PendingAttempt) {
        let Some((message, channel, qos)) = self.cached(offset) else {
            self.complete_offset(group, offset).await;
            return;
        };

        // Prefer a different member: the previous one may be gone or
        // wedged. If the group can no longer process it, dead-letter.
        let Some(member) = self.select_member(group, &channel, &message, Some(prev.member)) else {
            self.dead_letter(group, offset, "no remaining group member").await;
            return;
        };

        let Ok(permit) = Arc::clone(&member.semaphore).acquire_owned().await else {
            return;
        };

        {
            group.cursor.lock().await.begin(
                offset,
                prev.attempt + 1,
                Instant::now() + qos.ack_timeout,
                member.id,
            );
        }
        self.pending_acks.entry(message.id).or_default().push(AckKey {
            group: group.name.clone(),
            offset,
        });
        tm::TRANSPORT_MESSAGES_IN_FLIGHT.inc();

        let mut message = message;
        message.metadata.retry_count = prev.attempt;
        self.run_handler(Arc::clone(group), member, message, offset, permit);
    }

    async fn sweep_group(self: &Arc<Self>, group: &Arc<GroupRuntime>) {
        let expired = { group.cursor.lock().await.take_expired(Instant::now()) };
        for (offset, attempt) in expired {
            warn!(
                group = %group.name,
                offset,
                attempt = attempt.attempt,
                "Delivery unacknowledged past ack_timeout"
            );
            self.note_attempt_failed();
            self.after_failure(group, offset, attempt, "ack timeout").await;
        }
    }

    /// Append the unmodified message to the durable dead-letter channel,
    /// then mark the original offset processed for this group.
    async fn dead_letter(self: &Arc<Self>, group: &Arc<GroupRuntime>, offset: u64, reason: &str) {
        if let Some((message, channel, _)) = self.cached(offset) {
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            tm::TRANSPORT_MESSAGES_DEAD_LETTERED.inc();

            if channel.ends_with(".dlq") {
                self.emit(BusEvent::Error {
                    detail: format!(
                        "delivery of {} failed on dead-letter channel {channel}: {reason}",
                        message.id
                    ),
                });
            } else {
                let dlq_name = format!("{channel}.dlq");
                let dlq = self
                    .registry
                    .ensure(Channel::new(dlq_name, ChannelType::Topic))
                    .or_else(|_| {
                        self.registry
                            .ensure(Channel::new(GLOBAL_DLQ_CHANNEL, ChannelType::Topic))
                    });

                match dlq {
                    Ok(dlq) => self.append_dead_letter(&message, &dlq, &channel, reason).await,
                    Err(_) => self.emit(BusEvent::Error {
                        detail: format!("no dead-letter channel available for {channel}"),
                    }),
                }
            }
        }

        self.complete_offset(group, offset).await;
    }

    async fn append_dead_letter(
        self: &Arc<Self>,
        message: &Message,
        dlq: &Channel,
        channel: &str,
        reason: &str,
    ) {
        let Ok(payload) = serde_json::to_vec(message) else {
            self.emit(BusEvent::Error {
                detail: format!("failed to encode dead letter {}", message.id),
            });
            return;
        };

        let (ack, accepted) = oneshot::channel();
        let request = BatchRequest {
            entry: LogEntry {
                channel: dlq.name.clone(),
                payload,
            },
            ack,
        };
        if self.batch_tx.send(request).await.is_err() {
            return;
        }

        match accepted.await {
            Ok(Ok(new_offset)) => {
                self.cache.insert(
                    new_offset,
                    CacheEntry {
                        message: message.clone(),
                        channel: dlq.name.clone(),
                        qos: dlq.qos.clone(),
                        acked: AtomicBool::new(false),
                        inserted: Instant::now(),
                    },
                );
                warn!(
                    message_id = %message.id,
                    channel,
                    dlq = %dlq.name,
                    reason,
                    "Message dead-lettered"
                );
                self.emit(BusEvent::MessageDeadLettered {
                    channel: channel.to_string(),
                    dlq_channel: dlq.name.clone(),
                    message_id: message.id,
                    reason: reason.to_string(),
                });
                self.notify_groups();
            }
            Ok(Err(error)) => self.emit(BusEvent::Error {
                detail: format!("dead-letter append failed: {error}"),
            }),
            Err(_) => {}
        }
    }

    async fn complete_offset(self: &Arc<Self>, group: &Arc<GroupRuntime>, offset: u64) {
        let advanced = { group.cursor.lock().await.complete(offset) };
        if let Some(cached) = self.cache.get(&offset) {
            cached.acked.store(true, Ordering::Release);
            self.drop_ack_key(cached.message.id, group, offset);
        }
        if advanced {
            self.persist_cursor(group).await;
        }
    }

    fn drop_ack_key(&self, message_id: Uuid, group: &GroupRuntime, offset: u64) {
        if let Some(mut keys) = self.pending_acks.get_mut(&message_id) {
            keys.retain(|k| !(k.group == group.name && k.offset == offset));
        }
        self.pending_acks
            .remove_if(&message_id, |_, keys| keys.is_empty());
    }

    fn cached(&self, offset: u64) -> Option<(Message, String, QosPolicy)> {
        self.cache
            .get(&offset)
            .map(|c| (c.message.clone(), c.channel.clone(), c.qos.clone()))
    }

    async fn persist_cursor(self: &Arc<Self>, group: &Arc<GroupRuntime>) {
        let committed = { group.cursor.lock().await.committed() };
        match self.acquire(Priority::Low).await {
            Ok(conn) => {
                if let Err(error) = conn.log.store_cursor(&group.name, committed).await {
                    self.note_store_failure(&error);
                } else {
                    self.note_store_ok();
                }
            }
            Err(error) => self.note_store_failure(&error),
        }
    }

    // =========================================================================
    // CACHE EVICTION
    // =========================================================================

    fn spawn_eviction(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let interval = inner.config.cache_eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let ttl = inner.config.cache_ttl;
                let before = inner.cache.len();
                inner
                    .cache
                    .retain(|_, entry| {
                        !(entry.acked.load(Ordering::Acquire) && entry.inserted.elapsed() >= ttl)
                    });
                let evicted = before - inner.cache.len();
                if evicted > 0 {
                    debug!(evicted, "Evicted acknowledged cache entries");
                }
            }
        });
    }

    // =========================================================================
    // SUBSCRIPTION LIFECYCLE
    // =========================================================================

    fn remove_subscription(&self, id: Uuid) -> bool {
        let Some((_, group_name)) = self.sub_index.remove(&id) else {
            return false;
        };

        if let Some(runtime) = self.group(&group_name) {
            let mut members = runtime.members.lock();
            if let Some(position) = members.iter().position(|m| m.id == id) {
                members[position].active.store(false, Ordering::Release);
                members.remove(position);
            }
            let empty = members.is_empty();
            drop(members);

            if empty {
                self.groups
                    .remove_if(&group_name, |_, rt| rt.members.lock().is_empty());
                runtime.notify.notify_one();
            }
        }

        self.emit(BusEvent::SubscriptionRemoved {
            subscription_id: id,
        });
        true
    }
}
