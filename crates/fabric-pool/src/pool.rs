//! Generic async resource pool.
//!
//! Resources are created by a [`ResourceFactory`], borrowed through RAII
//! [`PoolGuard`]s, and retired by the maintenance task when unhealthy or
//! idle too long. Waiters are queued by [`Priority`] and served in order
//! on every release.

use crate::manager::ResourceManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Errors from pool operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No resource became available within `acquire_timeout`.
    #[error("Timed out acquiring a resource after {waited_ms} ms")]
    AcquireTimeout { waited_ms: u64 },

    /// The factory failed to create a resource.
    #[error("Resource factory failed: {reason}")]
    Factory { reason: String },

    /// The pool has been closed.
    #[error("Pool is closed")]
    Closed,
}

/// A poolable connection or handle.
#[async_trait]
pub trait PooledResource: Send + Sync + 'static {
    /// Liveness probe, called by the maintenance task on idle resources.
    async fn is_healthy(&self) -> bool;

    /// Release underlying state. Called once, on retirement.
    async fn close(&self);
}

/// Creates pool resources on demand.
#[async_trait]
pub trait ResourceFactory<R: PooledResource>: Send + Sync + 'static {
    /// Open a new resource.
    async fn create(&self) -> Result<R, PoolError>;
}

/// Acquisition priority. Waiters are served High before Normal before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Pool sizing and maintenance knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Resources kept alive even when idle.
    pub min_size: usize,
    /// Hard per-pool cap.
    pub max_size: usize,
    /// How long `acquire` waits before failing.
    pub acquire_timeout: Duration,
    /// Idle age beyond which resources above `min_size` are retired.
    pub idle_timeout: Duration,
    /// Cadence of the health-check / eviction / autoscale pass.
    pub maintenance_interval: Duration,
    /// Pending waiters that trigger scale-up.
    pub scale_up_pending_threshold: usize,
    /// Idle fraction that triggers scale-down.
    pub scale_down_idle_ratio: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(10),
            scale_up_pending_threshold: 2,
            scale_down_idle_ratio: 0.5,
        }
    }
}

/// Point-in-time pool gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    /// Live resources owned by the pool.
    pub size: usize,
    /// Resources currently parked idle.
    pub idle: usize,
    /// Resources currently checked out.
    pub in_use: usize,
    /// Waiters blocked in `acquire`.
    pub pending: usize,
    /// `in_use / size`, zero for an empty pool.
    pub utilization: f64,
}

struct IdleResource<R> {
    resource: R,
    idle_since: Instant,
}

struct PoolState<R> {
    idle: VecDeque<IdleResource<R>>,
    /// Live resources: idle + checked out.
    size: usize,
}

struct PoolInner<R: PooledResource> {
    name: String,
    factory: Arc<dyn ResourceFactory<R>>,
    config: PoolConfig,
    manager: Arc<ResourceManager>,
    state: Mutex<PoolState<R>>,
    waiters: Mutex<[VecDeque<oneshot::Sender<R>>; Priority::COUNT]>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// A pooled-resource handle. Dereferences to the resource; returning it to
/// the pool is the drop behavior, so one unit of work per guard is the
/// natural shape.
pub struct PoolGuard<R: PooledResource> {
    resource: Option<R>,
    pool: Arc<PoolInner<R>>,
}

impl<R: PooledResource> Deref for PoolGuard<R> {
    type Target = R;

    fn deref(&self) -> &R {
        // Present from construction until drop.
        self.resource.as_ref().expect("pool guard already released")
    }
}

impl<R: PooledResource> Drop for PoolGuard<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

/// A pool of reusable resources with priority queuing and autoscaling.
pub struct ResourcePool<R: PooledResource> {
    inner: Arc<PoolInner<R>>,
}

impl<R: PooledResource> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: PooledResource> ResourcePool<R> {
    /// Create a pool and start its maintenance task. Must be called inside
    /// a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn ResourceFactory<R>>,
        config: PoolConfig,
        manager: Arc<ResourceManager>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            name: name.into(),
            factory,
            config,
            manager,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                size: 0,
            }),
            waiters: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        PoolInner::spawn_maintenance(&inner);
        Self { inner }
    }

    /// Borrow a resource, waiting up to `acquire_timeout` when the pool is
    /// at capacity.
    ///
    /// # Errors
    ///
    /// - `PoolError::Closed` once the pool is shut down
    /// - `PoolError::Factory` when opening a new resource fails
    /// - `PoolError::AcquireTimeout` when no resource frees up in time
    pub async fn acquire(&self, priority: Priority) -> Result<PoolGuard<R>, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        if let Some(resource) = inner.checkout_idle() {
            return Ok(inner.guard(resource));
        }
        if let Some(resource) = inner.try_create().await? {
            return Ok(inner.guard(resource));
        }

        // At capacity: queue and wait for a release to hand one over.
        let (tx, rx) = oneshot::channel();
        inner.waiters.lock()[priority.index()].push_back(tx);
        inner.pending.fetch_add(1, Ordering::SeqCst);

        // A release between the fast path and waiter registration would
        // otherwise be missed; the stale queue entry is skipped on the
        // next release because its receiver is gone.
        if let Some(resource) = inner.checkout_idle() {
            inner.pending.fetch_sub(1, Ordering::SeqCst);
            return Ok(inner.guard(resource));
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(inner.config.acquire_timeout, rx).await;
        inner.pending.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(resource)) => Ok(inner.guard(resource)),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => Err(PoolError::AcquireTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Current gauges.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let size = state.size;
        let idle = state.idle.len();
        drop(state);
        let in_use = size.saturating_sub(idle);
        PoolStats {
            size,
            idle,
            in_use,
            pending: self.inner.pending.load(Ordering::Relaxed),
            utilization: if size == 0 {
                0.0
            } else {
                in_use as f64 / size as f64
            },
        }
    }

    /// The pool's name, used in logs and metrics labels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Close the pool: new acquires fail, idle resources are closed, and
    /// checked-out resources are closed as their guards drop.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let idle: Vec<IdleResource<R>> = {
            let mut state = self.inner.state.lock();
            state.idle.drain(..).collect()
        };
        for item in idle {
            self.inner.retire(item.resource).await;
        }
        // Waiters learn of the closure when their senders drop.
        for queue in self.inner.waiters.lock().iter_mut() {
            queue.clear();
        }
    }
}

impl<R: PooledResource> PoolInner<R> {
    fn guard(self: &Arc<Self>, resource: R) -> PoolGuard<R> {
        PoolGuard {
            resource: Some(resource),
            pool: Arc::clone(self),
        }
    }

    fn checkout_idle(&self) -> Option<R> {
        self.state.lock().idle.pop_front().map(|i| i.resource)
    }

    /// Open a new resource if both the pool cap and the global cap allow.
    async fn try_create(&self) -> Result<Option<R>, PoolError> {
        {
            let mut state = self.state.lock();
            if state.size >= self.config.max_size {
                return Ok(None);
            }
            if !self.manager.try_reserve() {
                return Ok(None);
            }
            state.size += 1;
        }

        match self.factory.create().await {
            Ok(resource) => {
                debug!(pool = %self.name, "Resource created");
                Ok(Some(resource))
            }
            Err(error) => {
                self.state.lock().size -= 1;
                self.manager.release_slot();
                warn!(pool = %self.name, error = %error, "Resource creation failed");
                Err(error)
            }
        }
    }

    /// Return a resource: hand it to the longest-waiting highest-priority
    /// waiter, else park it idle.
    fn release(self: &Arc<Self>, resource: R) {
        if self.closed.load(Ordering::Acquire) {
            self.retire_detached(resource);
            return;
        }

        let mut pending = resource;
        {
            let mut waiters = self.waiters.lock();
            for queue in waiters.iter_mut() {
                while let Some(tx) = queue.pop_front() {
                    match tx.send(pending) {
                        Ok(()) => return,
                        // Receiver gave up (timeout); try the next waiter.
                        Err(back) => pending = back,
                    }
                }
            }
        }

        self.state.lock().idle.push_back(IdleResource {
            resource: pending,
            idle_since: Instant::now(),
        });
    }

    /// Close a resource and give back its accounting slots.
    async fn retire(&self, resource: R) {
        resource.close().await;
        self.state.lock().size -= 1;
        self.manager.release_slot();
    }

    /// Retire from a sync context (guard drop after close).
    fn retire_detached(self: &Arc<Self>, resource: R) {
        self.state.lock().size -= 1;
        self.manager.release_slot();
        tokio::spawn(async move {
            resource.close().await;
        });
    }

    fn spawn_maintenance(inner: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let interval = inner.config.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                inner.maintain().await;
            }
        });
    }

    /// One maintenance pass: health checks, idle eviction, autoscaling.
    async fn maintain(self: &Arc<Self>) {
        // Health-check idle resources outside the lock.
        let candidates: Vec<IdleResource<R>> = {
            let mut state = self.state.lock();
            state.idle.drain(..).collect()
        };
        let mut healthy = Vec::with_capacity(candidates.len());
        for item in candidates {
            if item.resource.is_healthy().await {
                healthy.push(item);
            } else {
                debug!(pool = %self.name, "Retiring unhealthy resource");
                self.retire(item.resource).await;
            }
        }

        // Put survivors back, oldest first, then decide evictions.
        let now = Instant::now();
        let mut to_close = Vec::new();
        {
            let mut state = self.state.lock();
            for item in healthy {
                state.idle.push_back(item);
            }
            state
                .idle
                .make_contiguous()
                .sort_by_key(|item| item.idle_since);

            // Timeout-based eviction above min_size.
            while state.size > self.config.min_size {
                let expired = state
                    .idle
                    .front()
                    .is_some_and(|item| now.duration_since(item.idle_since) > self.config.idle_timeout);
                if !expired {
                    break;
                }
                if let Some(item) = state.idle.pop_front() {
                    state.size -= 1;
                    to_close.push(item.resource);
                }
            }

            // Ratio-based scale-down: one per pass, oldest idle first.
            let idle_ratio = if state.size == 0 {
                0.0
            } else {
                state.idle.len() as f64 / state.size as f64
            };
            if state.size > self.config.min_size && idle_ratio > self.config.scale_down_idle_ratio {
                if let Some(item) = state.idle.pop_front() {
                    state.size -= 1;
                    to_close.push(item.resource);
                }
            }
        }
        for resource in to_close {
            resource.close().await;
            self.manager.release_slot();
        }

        // Scale up for queued demand, and keep the floor warm.
        let pending = self.pending.load(Ordering::Relaxed);
        let deficit = {
            let state = self.state.lock();
            let floor = self.config.min_size.saturating_sub(state.size);
            let demand = if pending >= self.config.scale_up_pending_threshold {
                pending.min(self.config.max_size.saturating_sub(state.size))
            } else {
                0
            };
            floor.max(demand)
        };
        for _ in 0..deficit {
            match self.try_create().await {
                Ok(Some(resource)) => self.release(resource),
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }
}
