//! Exponential backoff policy for redelivery scheduling.
//!
//! `delay = initial * 2^retry_index`, capped at `max`. The same policy is
//! shared by the in-process broker and the durable transport.

use std::time::Duration;

/// Retry delay schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first redelivery.
    pub initial: Duration,
    /// Ceiling for the computed delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry_index` (0-based: the first
    /// redelivery waits `initial`).
    #[must_use]
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        // Shift clamps well before the multiplier overflows; `max` caps
        // the result long before that in practice.
        let factor = 1u32 << retry_index.min(31);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_capped_at_max() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }
}
