//! Metrics and activity tracking
//!
//! - `latency`: bounded sample rings with percentile reporting
//! - `activity`: active users, request rate, grouped error ring
//! - cache hit/miss counters per key prefix and queue throughput counters
//!
//! Everything is snapshottable for the dashboard endpoint and resettable by
//! kind.

pub mod activity;
pub mod latency;

pub use activity::{ActivitySnapshot, ActivityTracker, ErrorEntry};
pub use latency::{LatencySnapshot, LatencyTracker, RING_SIZE};

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Warn threshold for cache operations
pub const CACHE_SLOW_THRESHOLD: Duration = Duration::from_millis(10);

/// Warn threshold for upstream operations
pub const UPSTREAM_SLOW_THRESHOLD: Duration = Duration::from_millis(100);

// ============================================================================
// Cache metrics
// ============================================================================

#[derive(Default)]
struct PrefixCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    total_ms: AtomicU64,
    samples: AtomicU64,
}

/// Per-prefix cache hit/miss statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefixSnapshot {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// Hit ratio in [0, 1]
    pub hit_rate: f64,
    /// Moving average response time, milliseconds
    pub avg_response_ms: f64,
}

/// Cache metrics summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetricsSnapshot {
    /// Total hits
    pub hits: u64,
    /// Total misses
    pub misses: u64,
    /// Overall hit ratio in [0, 1]
    pub hit_rate: f64,
    /// Per-prefix breakdown
    pub by_prefix: HashMap<String, PrefixSnapshot>,
}

/// Hit/miss counters per key prefix
pub struct CacheMetrics {
    prefixes: DashMap<String, PrefixCounters>,
}

impl CacheMetrics {
    /// Empty counters
    pub fn new() -> Self {
        Self {
            prefixes: DashMap::new(),
        }
    }

    fn counters(&self, prefix: &str) -> dashmap::mapref::one::RefMut<'_, String, PrefixCounters> {
        self.prefixes.entry(prefix.to_string()).or_default()
    }

    /// Record a hit with its lookup latency
    pub fn record_hit(&self, prefix: &str, elapsed: Duration) {
        let counters = self.counters(prefix);
        counters.hits.fetch_add(1, Ordering::Relaxed);
        counters
            .total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        counters.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss with its load latency
    pub fn record_miss(&self, prefix: &str, elapsed: Duration) {
        let counters = self.counters(prefix);
        counters.misses.fetch_add(1, Ordering::Relaxed);
        counters
            .total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        counters.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        let mut by_prefix = HashMap::new();
        let mut hits = 0u64;
        let mut misses = 0u64;

        for entry in self.prefixes.iter() {
            let prefix_hits = entry.hits.load(Ordering::Relaxed);
            let prefix_misses = entry.misses.load(Ordering::Relaxed);
            let samples = entry.samples.load(Ordering::Relaxed);
            let total = prefix_hits + prefix_misses;
            hits += prefix_hits;
            misses += prefix_misses;

            by_prefix.insert(
                entry.key().clone(),
                PrefixSnapshot {
                    hits: prefix_hits,
                    misses: prefix_misses,
                    hit_rate: if total > 0 {
                        prefix_hits as f64 / total as f64
                    } else {
                        0.0
                    },
                    avg_response_ms: if samples > 0 {
                        entry.total_ms.load(Ordering::Relaxed) as f64 / samples as f64
                    } else {
                        0.0
                    },
                },
            );
        }

        let total = hits + misses;
        CacheMetricsSnapshot {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            by_prefix,
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.prefixes.clear();
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Queue metrics
// ============================================================================

/// Sync-queue throughput summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetricsSnapshot {
    /// Items processed successfully
    pub processed: u64,
    /// Items failed terminally
    pub failed: u64,
    /// Requeues after retryable failures
    pub retries: u64,
    /// Items dropped on overflow
    pub dropped: u64,
    /// Mean time from pop to resolution, milliseconds
    pub avg_processing_ms: f64,
}

/// Sync-queue throughput counters
pub struct QueueMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    total_ms: AtomicU64,
}

impl QueueMetrics {
    /// Zeroed counters
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
        }
    }

    /// Record a successful item with its processing time
    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a terminal failure with its processing time
    pub fn record_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a requeue
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an overflow drop
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let resolved = processed + failed;
        QueueMetricsSnapshot {
            processed,
            failed,
            retries: self.retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            avg_processing_ms: if resolved > 0 {
                self.total_ms.load(Ordering::Relaxed) as f64 / resolved as f64
            } else {
                0.0
            },
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.total_ms.store(0, Ordering::Relaxed);
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Which metric family to reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsKind {
    /// Cache hit/miss counters
    Cache,
    /// Latency rings
    Latency,
    /// Queue counters
    Queue,
    /// Everything, including activity
    All,
}

impl FromStr for MetricsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" => Ok(MetricsKind::Cache),
            "latency" => Ok(MetricsKind::Latency),
            "queue" => Ok(MetricsKind::Queue),
            "all" => Ok(MetricsKind::All),
            other => Err(format!("unknown metrics kind: {}", other)),
        }
    }
}

/// All metric families behind one handle
pub struct MetricsRegistry {
    /// Cache hit/miss counters
    pub cache: CacheMetrics,
    /// Cache operation latencies
    pub cache_latency: LatencyTracker,
    /// Upstream call latencies
    pub upstream_latency: LatencyTracker,
    /// Sync-queue throughput
    pub queue: QueueMetrics,
    /// User/request/error activity
    pub activity: ActivityTracker,
}

impl MetricsRegistry {
    /// Fresh registry with the standard thresholds
    pub fn new() -> Self {
        Self {
            cache: CacheMetrics::new(),
            cache_latency: LatencyTracker::new("cache", CACHE_SLOW_THRESHOLD),
            upstream_latency: LatencyTracker::new("upstream", UPSTREAM_SLOW_THRESHOLD),
            queue: QueueMetrics::new(),
            activity: ActivityTracker::new(),
        }
    }

    /// Reset one metric family
    pub fn reset(&self, kind: MetricsKind) {
        match kind {
            MetricsKind::Cache => self.cache.reset(),
            MetricsKind::Latency => {
                self.cache_latency.reset();
                self.upstream_latency.reset();
            }
            MetricsKind::Queue => self.queue.reset(),
            MetricsKind::All => {
                self.cache.reset();
                self.cache_latency.reset();
                self.upstream_latency.reset();
                self.queue.reset();
                self.activity.reset();
            }
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
