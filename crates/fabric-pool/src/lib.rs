//! # Fabric Pool - Resource/Connection Manager
//!
//! Pools and auto-scales downstream connections for the durable transport.
//! A pool owns every live resource; borrowers follow acquire → use →
//! release, never holding a connection past one unit of work.
//!
//! - `acquire(priority)` queues High/Normal/Low waiters separately, so
//!   latency-sensitive work (acknowledgment cursors) jumps batched writes
//! - a fixed-interval maintenance task health-checks idle resources,
//!   evicts those idle past the timeout, and scales the pool between
//!   `min_size` and `max_size` based on pending-request depth and idle
//!   ratio - scaling is never decided per-operation
//! - the [`ResourceManager`] caps total resources across all pools

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod manager;
pub mod pool;

pub use manager::ResourceManager;
pub use pool::{
    PoolConfig, PoolError, PoolGuard, PoolStats, PooledResource, Priority, ResourceFactory,
    ResourcePool,
};
