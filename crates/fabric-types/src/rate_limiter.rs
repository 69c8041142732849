//! # Rate Limiter
//!
//! Token bucket rate limiter for per-project send quotas.
//!
//! ## Algorithm
//!
//! - Tokens are added at a fixed rate (`events_per_second`)
//! - The bucket holds at most `burst_limit` tokens
//! - Each send consumes one token; sends are rejected when none remain

use crate::project::RateLimitPolicy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Token bucket rate limiter.
pub struct RateLimiter {
    /// Maximum tokens in bucket.
    capacity: u64,
    /// Tokens to add per second.
    refill_rate: u64,
    /// Current token count.
    tokens: AtomicU64,
    /// Last refill time.
    last_refill: Mutex<Instant>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Parameters
    ///
    /// - `capacity`: maximum burst size
    /// - `refill_rate`: tokens per second
    #[must_use]
    pub fn new(capacity: u64, refill_rate: u64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: AtomicU64::new(capacity),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Build a limiter from a project's rate-limit policy.
    #[must_use]
    pub fn from_policy(policy: &RateLimitPolicy) -> Self {
        // A zero burst would reject everything; clamp to the sustained rate.
        let capacity = policy.burst_limit.max(policy.events_per_second).max(1);
        Self::new(capacity, policy.events_per_second)
    }

    /// Try to acquire a token.
    ///
    /// Returns `true` if the send is allowed, `false` if rate limited.
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current == 0 {
                return false;
            }

            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Refill tokens based on elapsed time.
    fn refill(&self) {
        let Ok(mut last) = self.last_refill.lock() else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(*last);

        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate as f64) as u64;

        if tokens_to_add > 0 {
            *last = now;

            loop {
                let current = self.tokens.load(Ordering::Relaxed);
                let new_value = (current + tokens_to_add).min(self.capacity);

                if self
                    .tokens
                    .compare_exchange(current, new_value, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    /// Get current available tokens.
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed)
    }

    /// Check if rate limited without consuming a token.
    pub fn is_limited(&self) -> bool {
        self.available() == 0
    }
}
