//! Sliding-window latency quantiles.
//!
//! Real percentiles over recorded samples rather than a simulated spread:
//! samples older than the window are pruned on access, and p50/p95/p99 are
//! read from the sorted window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Point-in-time latency summary.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySnapshot {
    /// Samples inside the window.
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Bounded window of processing-latency samples.
pub(crate) struct LatencyWindow {
    samples: Mutex<VecDeque<(Instant, f64)>>,
    window: Duration,
    max_samples: usize,
}

impl LatencyWindow {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            window,
            max_samples: max_samples.max(1),
        }
    }

    /// Record one sample.
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        samples.push_back((Instant::now(), latency.as_secs_f64() * 1000.0));
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Samples per second over the window - the consumption throughput.
    pub fn rate_per_sec(&self) -> f64 {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.window);
        samples.len() as f64 / self.window.as_secs_f64().max(f64::EPSILON)
    }

    /// Compute the current summary.
    pub fn snapshot(&self) -> LatencySnapshot {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.window);

        if samples.is_empty() {
            return LatencySnapshot::default();
        }

        let mut values: Vec<f64> = samples.iter().map(|(_, ms)| *ms).collect();
        drop(samples);
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = values.len();
        let avg = values.iter().sum::<f64>() / count as f64;
        LatencySnapshot {
            count,
            avg_ms: avg,
            p50_ms: Self::quantile(&values, 0.50),
            p95_ms: Self::quantile(&values, 0.95),
            p99_ms: Self::quantile(&values, 0.99),
        }
    }

    fn prune(samples: &mut VecDeque<(Instant, f64)>, window: Duration) {
        let cutoff = Instant::now() - window;
        while samples.front().is_some_and(|(at, _)| *at < cutoff) {
            samples.pop_front();
        }
    }

    fn quantile(sorted: &[f64], q: f64) -> f64 {
        let index = ((sorted.len() - 1) as f64 * q).round() as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window() {
        let window = LatencyWindow::new(Duration::from_secs(60), 100);
        assert_eq!(window.snapshot(), LatencySnapshot::default());
    }

    #[test]
    fn test_quantiles_are_real() {
        let window = LatencyWindow::new(Duration::from_secs(60), 1000);
        for ms in 1..=100u64 {
            window.record(Duration::from_millis(ms));
        }

        let snapshot = window.snapshot();
        assert_eq!(snapshot.count, 100);
        assert!((snapshot.avg_ms - 50.5).abs() < 0.5);
        assert!((snapshot.p50_ms - 50.0).abs() <= 1.0);
        assert!((snapshot.p95_ms - 95.0).abs() <= 1.0);
        assert!((snapshot.p99_ms - 99.0).abs() <= 1.0);
    }

    #[test]
    fn test_bounded_sample_count() {
        let window = LatencyWindow::new(Duration::from_secs(60), 10);
        for ms in 0..100u64 {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.snapshot().count, 10);
    }
}
