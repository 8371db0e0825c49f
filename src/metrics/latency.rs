//! Latency sample rings
//!
//! Bounded rings of duration samples with percentile reporting. One ring
//! tracks cache operations (warn above 10 ms), one tracks upstream calls
//! (warn above 100 ms).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

/// Ring capacity
pub const RING_SIZE: usize = 1_000;

/// Aggregates over the current ring contents
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    /// Samples currently in the ring
    pub count: usize,
    /// Mean, milliseconds
    pub avg_ms: f64,
    /// Minimum, milliseconds
    pub min_ms: f64,
    /// Maximum, milliseconds
    pub max_ms: f64,
    /// 95th percentile, milliseconds
    pub p95_ms: f64,
    /// 99th percentile, milliseconds
    pub p99_ms: f64,
    /// Samples above the warn threshold since start
    pub threshold_breaches: u64,
}

/// Bounded ring of latency samples
pub struct LatencyTracker {
    label: &'static str,
    threshold: Duration,
    samples: RwLock<VecDeque<f64>>,
    breaches: AtomicU64,
}

impl LatencyTracker {
    /// Create a ring with a warn threshold
    pub fn new(label: &'static str, threshold: Duration) -> Self {
        Self {
            label,
            threshold,
            samples: RwLock::new(VecDeque::with_capacity(RING_SIZE)),
            breaches: AtomicU64::new(0),
        }
    }

    /// Record one sample
    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        {
            let mut samples = self.samples.write();
            if samples.len() == RING_SIZE {
                samples.pop_front();
            }
            samples.push_back(ms);
        }
        if elapsed > self.threshold {
            self.breaches.fetch_add(1, Ordering::Relaxed);
            warn!(
                operation = self.label,
                elapsed_ms = ms,
                threshold_ms = self.threshold.as_millis() as u64,
                "slow operation"
            );
        }
    }

    /// Aggregate the current ring
    pub fn snapshot(&self) -> LatencySnapshot {
        let samples = self.samples.read();
        let count = samples.len();
        if count == 0 {
            return LatencySnapshot {
                count: 0,
                avg_ms: 0.0,
                min_ms: 0.0,
                max_ms: 0.0,
                p95_ms: 0.0,
                p99_ms: 0.0,
                threshold_breaches: self.breaches.load(Ordering::Relaxed),
            };
        }

        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let percentile = |p: f64| -> f64 {
            let rank = ((p / 100.0) * count as f64).ceil() as usize;
            sorted[rank.clamp(1, count) - 1]
        };

        LatencySnapshot {
            count,
            avg_ms: sorted.iter().sum::<f64>() / count as f64,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            p95_ms: percentile(95.0),
            p99_ms: percentile(99.0),
            threshold_breaches: self.breaches.load(Ordering::Relaxed),
        }
    }

    /// Clear the ring and the breach counter
    pub fn reset(&self) {
        self.samples.write().clear();
        self.breaches.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentiles() {
        let tracker = LatencyTracker::new("test", Duration::from_secs(10));
        for ms in 1..=100u64 {
            tracker.record(Duration::from_millis(ms));
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.count, 100);
        assert_eq!(snap.min_ms, 1.0);
        assert_eq!(snap.max_ms, 100.0);
        assert_eq!(snap.p95_ms, 95.0);
        assert_eq!(snap.p99_ms, 99.0);
        assert!((snap.avg_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_ring_is_bounded() {
        let tracker = LatencyTracker::new("test", Duration::from_secs(10));
        for ms in 0..1500u64 {
            tracker.record(Duration::from_millis(ms));
        }
        let snap = tracker.snapshot();
        assert_eq!(snap.count, RING_SIZE);
        // Oldest 500 samples were displaced.
        assert_eq!(snap.min_ms, 500.0);
    }

    #[test]
    fn test_threshold_breaches() {
        let tracker = LatencyTracker::new("test", Duration::from_millis(10));
        tracker.record(Duration::from_millis(5));
        tracker.record(Duration::from_millis(15));
        tracker.record(Duration::from_millis(25));
        assert_eq!(tracker.snapshot().threshold_breaches, 2);

        tracker.reset();
        let snap = tracker.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.threshold_breaches, 0);
    }
}
