//! Global cap shared by every pool in a process.
//!
//! Each pool reserves a slot before creating a resource and releases it
//! when the resource is closed, so `max_total` bounds connections across
//! pools without the pools knowing about each other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide connection accounting.
#[derive(Debug)]
pub struct ResourceManager {
    max_total: usize,
    total: AtomicUsize,
}

impl ResourceManager {
    /// Create a manager allowing at most `max_total` live resources.
    #[must_use]
    pub fn new(max_total: usize) -> Arc<Self> {
        Arc::new(Self {
            max_total: max_total.max(1),
            total: AtomicUsize::new(0),
        })
    }

    /// Reserve one slot. Returns `false` when the global cap is reached.
    pub fn try_reserve(&self) -> bool {
        loop {
            let current = self.total.load(Ordering::Relaxed);
            if current >= self.max_total {
                return false;
            }
            if self
                .total
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Return a slot after a resource is closed.
    pub fn release_slot(&self) {
        let previous = self.total.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "slot released without reservation");
    }

    /// Live resources across all pools.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// The configured global cap.
    #[must_use]
    pub fn max_total(&self) -> usize {
        self.max_total
    }
}
