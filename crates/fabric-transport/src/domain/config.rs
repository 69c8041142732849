//! Transport configuration.

use fabric_bus::BackoffPolicy;
use fabric_pool::PoolConfig;
use std::time::Duration;

/// Tuning for the durable broker.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Entries per append batch; a full batch flushes immediately.
    pub batch_size: usize,
    /// A partial batch flushes after this long.
    pub batch_timeout: Duration,
    /// Outstanding publishes allowed in the write pipeline. Beyond this,
    /// `publish` applies backpressure.
    pub pipeline_depth: usize,
    /// Entries fetched per cursor read.
    pub read_batch: usize,
    /// Poll cadence when a group's cursor is caught up.
    pub poll_interval: Duration,
    /// Redelivery backoff schedule.
    pub backoff: BackoffPolicy,
    /// Append attempts against a failing store before the publish is
    /// rejected.
    pub store_retry_attempts: u32,
    /// Lifetime of fully-acknowledged entries in the local cache.
    pub cache_ttl: Duration,
    /// Cadence of the cache eviction pass.
    pub cache_eviction_interval: Duration,
    /// Consecutive store failures before `status()` reports unhealthy.
    pub unhealthy_after_failures: u32,
    /// Recent error rate above which `status()` reports degraded.
    pub degraded_error_rate: f64,
    /// Connection pool sizing for store access.
    pub pool: PoolConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            batch_timeout: Duration::from_millis(10),
            pipeline_depth: 256,
            read_batch: 64,
            poll_interval: Duration::from_millis(50),
            backoff: BackoffPolicy::default(),
            store_retry_attempts: 5,
            cache_ttl: Duration::from_secs(300),
            cache_eviction_interval: Duration::from_secs(60),
            unhealthy_after_failures: 3,
            degraded_error_rate: 0.10,
            pool: PoolConfig::default(),
        }
    }
}
