//! Upstream call scheduler
//!
//! Every upstream call made by any component goes through this limiter. It
//! enforces three constraints simultaneously:
//!
//! - **Reservoir**: a token bucket capped at `burst` tokens, refilled at
//!   `refill_rate` tokens per second
//! - **Minimum gap** between the start of consecutive calls
//! - **Maximum concurrency** of in-flight calls
//!
//! Pending calls wait in a bounded priority queue; higher priority first,
//! ties break FIFO. On overflow the lowest-priority pending call is dropped
//! and its caller notified, unless the incoming call ranks even lower, in
//! which case the incoming call is dropped instead.
//!
//! Dispatch runs on a dedicated background task; callers never touch the
//! queue directly.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Priority of a user-facing call path (conflict detection on a live write)
pub const PRIORITY_HIGH: u8 = 9;
/// Default priority
pub const PRIORITY_NORMAL: u8 = 5;
/// Priority of background work (warmup, cron refresh)
pub const PRIORITY_LOW: u8 = 1;

/// Why a scheduled call did not run, or how it failed
#[derive(Error, Debug)]
pub enum ScheduleError<E> {
    /// The call was evicted from the queue on overflow
    #[error("Call dropped: limiter queue overflow")]
    Dropped,

    /// The caller's deadline expired while the call was still queued
    #[error("Call cancelled before it was scheduled")]
    Cancelled,

    /// The call ran and failed; the original error is re-raised
    #[error(transparent)]
    Task(E),
}

/// Limiter tuning knobs
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Token bucket capacity (max call starts per refill window)
    pub burst: u32,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Minimum gap between the start of consecutive calls
    pub min_gap: Duration,
    /// Maximum in-flight calls
    pub max_concurrency: usize,
    /// Pending-queue bound
    pub max_queue: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            burst: 3,
            refill_rate: 3.0,
            min_gap: Duration::from_millis(334),
            max_concurrency: 2,
            max_queue: 20,
        }
    }
}

/// Cumulative limiter counters plus current levels
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStats {
    /// Calls currently waiting in the queue
    pub queued: usize,
    /// Calls currently in flight
    pub running: usize,
    /// Calls completed successfully
    pub completed: u64,
    /// Calls that ran and failed
    pub failed: u64,
    /// Calls dropped on queue overflow
    pub dropped: u64,
    /// Current reservoir level
    pub reservoir: f64,
}

struct Waiter {
    priority: u8,
    seq: u64,
    grant: oneshot::Sender<()>,
}

struct LimiterState {
    queue: Vec<Waiter>,
    tokens: f64,
    last_refill: Instant,
    last_start: Option<Instant>,
    inflight: usize,
}

impl LimiterState {
    fn refill(&mut self, config: &RateLimiterConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * config.refill_rate).min(config.burst as f64);
        self.last_refill = now;
    }

    /// Index of the next waiter to run: highest priority, oldest first
    fn best_index(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .max_by_key(|(_, w)| (w.priority, std::cmp::Reverse(w.seq)))
            .map(|(idx, _)| idx)
    }

    /// Index of the eviction victim: lowest priority, youngest first
    fn victim_index(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| (w.priority, std::cmp::Reverse(w.seq)))
            .map(|(idx, _)| idx)
    }
}

struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Prioritized token-bucket scheduler for upstream calls
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<LimiterState>>,
    notify: Arc<Notify>,
    counters: Arc<Counters>,
    next_seq: AtomicU64,
    dispatcher: JoinHandle<()>,
}

impl RateLimiter {
    /// Create a limiter with the given knobs and start its dispatcher
    pub fn new(config: RateLimiterConfig) -> Self {
        let state = Arc::new(Mutex::new(LimiterState {
            queue: Vec::new(),
            tokens: config.burst as f64,
            last_refill: Instant::now(),
            last_start: None,
            inflight: 0,
        }));
        let notify = Arc::new(Notify::new());

        let dispatcher = tokio::spawn(Self::dispatch_loop(
            config.clone(),
            Arc::clone(&state),
            Arc::clone(&notify),
        ));

        Self {
            config,
            state,
            notify,
            counters: Arc::new(Counters {
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            next_seq: AtomicU64::new(0),
            dispatcher,
        }
    }

    /// Create a limiter with the default upstream pacing (3/s, 334ms gap,
    /// concurrency 2)
    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    async fn dispatch_loop(
        config: RateLimiterConfig,
        state: Arc<Mutex<LimiterState>>,
        notify: Arc<Notify>,
    ) {
        loop {
            let wait = {
                let mut s = state.lock();
                let now = Instant::now();
                s.refill(&config, now);

                if s.queue.is_empty() || s.inflight >= config.max_concurrency {
                    None
                } else {
                    let mut delay = Duration::ZERO;
                    if s.tokens < 1.0 {
                        let missing = 1.0 - s.tokens;
                        delay = delay.max(Duration::from_secs_f64(missing / config.refill_rate));
                    }
                    if let Some(last) = s.last_start {
                        let gap_ready = last + config.min_gap;
                        if gap_ready > now {
                            delay = delay.max(gap_ready - now);
                        }
                    }

                    if delay.is_zero() {
                        // Grant waiters until a send succeeds; a failed send
                        // means the waiter gave up, its token stays unspent.
                        while let Some(idx) = s.best_index() {
                            let waiter = s.queue.remove(idx);
                            if waiter.grant.send(()).is_ok() {
                                s.tokens -= 1.0;
                                s.last_start = Some(now);
                                s.inflight += 1;
                                break;
                            }
                        }
                        None
                    } else {
                        Some(delay)
                    }
                }
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = notify.notified() => {}
                    }
                }
                None => {
                    let pending = {
                        let s = state.lock();
                        !s.queue.is_empty() && s.inflight < config.max_concurrency
                    };
                    if !pending {
                        notify.notified().await;
                    }
                }
            }
        }
    }

    fn enqueue(&self, priority: u8) -> Result<(u64, oneshot::Receiver<()>), ()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut s = self.state.lock();
        if s.queue.len() >= self.config.max_queue {
            match s.victim_index() {
                Some(idx) if s.queue[idx].priority < priority => {
                    // Evict the lowest-priority pending call; dropping its
                    // sender reports the drop to that caller.
                    s.queue.remove(idx);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    // The incoming call ranks lowest; drop it instead.
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(());
                }
            }
        }
        s.queue.push(Waiter {
            priority,
            seq,
            grant: tx,
        });
        drop(s);

        self.notify.notify_one();
        Ok((seq, rx))
    }

    fn release_slot(&self) {
        let mut s = self.state.lock();
        s.inflight = s.inflight.saturating_sub(1);
        drop(s);
        self.notify.notify_one();
    }

    /// Schedule a call at the given priority and await its result
    ///
    /// The task future is not polled until the limiter grants a slot. If the
    /// task fails, the failure is counted and re-raised; the slot releases
    /// normally either way.
    pub async fn schedule<F, T, E>(&self, priority: u8, task: F) -> Result<T, ScheduleError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let (_, rx) = self.enqueue(priority).map_err(|_| ScheduleError::Dropped)?;
        rx.await.map_err(|_| ScheduleError::Dropped)?;

        let result = task.await;
        self.release_slot();

        match result {
            Ok(value) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(ScheduleError::Task(err))
            }
        }
    }

    /// Schedule with a caller deadline; expiry while still queued removes the
    /// call from the queue without consuming a token
    pub async fn schedule_with_deadline<F, T, E>(
        &self,
        priority: u8,
        deadline: Duration,
        task: F,
    ) -> Result<T, ScheduleError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let (seq, rx) = self.enqueue(priority).map_err(|_| ScheduleError::Dropped)?;

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(ScheduleError::Dropped),
            Err(_) => {
                let mut s = self.state.lock();
                if let Some(idx) = s.queue.iter().position(|w| w.seq == seq) {
                    s.queue.remove(idx);
                    return Err(ScheduleError::Cancelled);
                }
                drop(s);
                // The grant raced the deadline; give the slot back.
                self.release_slot();
                return Err(ScheduleError::Cancelled);
            }
        }

        let result = task.await;
        self.release_slot();

        match result {
            Ok(value) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(ScheduleError::Task(err))
            }
        }
    }

    /// Schedule at [`PRIORITY_HIGH`]
    pub async fn schedule_high_priority<F, T, E>(&self, task: F) -> Result<T, ScheduleError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.schedule(PRIORITY_HIGH, task).await
    }

    /// Schedule at [`PRIORITY_LOW`]
    pub async fn schedule_low_priority<F, T, E>(&self, task: F) -> Result<T, ScheduleError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.schedule(PRIORITY_LOW, task).await
    }

    /// Counter snapshot
    pub fn stats(&self) -> LimiterStats {
        let s = self.state.lock();
        LimiterStats {
            queued: s.queue.len(),
            running: s.inflight,
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            reservoir: s.tokens,
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn quick_config() -> RateLimiterConfig {
        RateLimiterConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_min_gap_and_rate() {
        let limiter = Arc::new(RateLimiter::new(quick_config()));
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = Arc::clone(&limiter);
            let starts = Arc::clone(&starts);
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(PRIORITY_NORMAL, async {
                        starts.lock().push(Instant::now());
                        Ok::<_, ()>(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut observed = starts.lock().clone();
        observed.sort();
        assert_eq!(observed.len(), 9);
        for pair in observed.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(333),
                "gap between starts was {:?}",
                gap
            );
        }
        // Any 1-second window contains at most 3 starts.
        for (i, start) in observed.iter().enumerate() {
            let in_window = observed[i..]
                .iter()
                .take_while(|s| **s - *start < Duration::from_secs(1))
                .count();
            assert!(in_window <= 3, "{} starts within one second", in_window);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap() {
        let limiter = Arc::new(RateLimiter::new(quick_config()));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(PRIORITY_NORMAL, async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ()>(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order() {
        let config = RateLimiterConfig {
            min_gap: Duration::from_millis(100),
            max_concurrency: 1,
            ..quick_config()
        };
        let limiter = Arc::new(RateLimiter::new(config));
        let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        // Saturate the limiter so later submissions queue up.
        let blocker = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .schedule(PRIORITY_NORMAL, async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Ok::<_, ()>(())
                    })
                    .await
                    .unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut handles = Vec::new();
        for priority in [PRIORITY_LOW, PRIORITY_HIGH, PRIORITY_NORMAL] {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(priority, async {
                        order.lock().push(priority);
                        Ok::<_, ()>(())
                    })
                    .await
                    .unwrap();
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(order.lock().clone(), vec![PRIORITY_HIGH, PRIORITY_NORMAL, PRIORITY_LOW]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_drops_lowest_priority() {
        let config = RateLimiterConfig {
            max_queue: 2,
            max_concurrency: 1,
            ..quick_config()
        };
        let limiter = Arc::new(RateLimiter::new(config));

        // Occupy the single slot.
        let blocker = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _ = limiter
                    .schedule(PRIORITY_NORMAL, async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, ()>(())
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Fill the queue with two low-priority calls.
        let mut lows = Vec::new();
        for _ in 0..2 {
            let limiter = Arc::clone(&limiter);
            lows.push(tokio::spawn(async move {
                limiter
                    .schedule(PRIORITY_LOW, async { Ok::<_, ()>(()) })
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // A high-priority call evicts one of them.
        let high = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .schedule(PRIORITY_HIGH, async { Ok::<_, ()>(()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // An incoming call below everything queued is dropped outright.
        let rejected = limiter.schedule(0, async { Ok::<_, ()>(()) }).await;
        assert!(matches!(rejected, Err(ScheduleError::Dropped)));

        let low_results: Vec<_> = futures::future::join_all(lows)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            low_results
                .iter()
                .filter(|r| matches!(r, Err(ScheduleError::Dropped)))
                .count(),
            1
        );

        blocker.await.unwrap();
        assert!(high.await.unwrap().is_ok());
        assert!(limiter.stats().dropped >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancellation_keeps_token() {
        let config = RateLimiterConfig {
            max_concurrency: 1,
            ..quick_config()
        };
        let limiter = Arc::new(RateLimiter::new(config));

        let blocker = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                let _ = limiter
                    .schedule(PRIORITY_NORMAL, async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, ()>(())
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let before = limiter.stats().reservoir;
        let result = limiter
            .schedule_with_deadline(
                PRIORITY_NORMAL,
                Duration::from_millis(100),
                async { Ok::<_, ()>(()) },
            )
            .await;
        assert!(matches!(result, Err(ScheduleError::Cancelled)));
        assert_eq!(limiter.stats().queued, 0);
        assert!(limiter.stats().reservoir >= before);

        blocker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_counts_and_reraises() {
        let limiter = RateLimiter::with_defaults();
        let result: Result<(), _> = limiter
            .schedule(PRIORITY_NORMAL, async { Err::<(), _>("boom") })
            .await;
        assert!(matches!(result, Err(ScheduleError::Task("boom"))));
        let stats = limiter.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 0);
    }
}
