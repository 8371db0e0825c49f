//! Cache-or-fetch orchestration
//!
//! [`CacheManager::get_or_fetch`] returns the cached value on hit, otherwise
//! runs the caller's loader, fills the cache and returns the result.
//! Concurrent misses on the same key share a single loader invocation: the
//! first caller becomes the leader, everyone else awaits the same completion
//! slot. Loader failures propagate to every waiter; nothing negative is
//! cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::domain::EntityKind;
use crate::error::{AppError, AppResult};
use crate::metrics::MetricsRegistry;
use crate::upstream::client::{ListFilter, TaskRangeQuery, UpstreamApi};
use crate::upstream::limiter::PRIORITY_LOW;

use super::keys::{self, key_prefix};
use super::store::{CacheKind, CacheStore};

type LoadSlot = watch::Receiver<Option<AppResult<Value>>>;

/// What a warmup pass populated
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupReport {
    /// Tasks cached from the hot calendar window
    pub tasks: usize,
    /// Entities cached per kind
    pub entities: HashMap<String, usize>,
    /// Sections that failed
    pub errors: Vec<String>,
}

/// Get-cached-or-fetch orchestrator with single-flight deduplication
pub struct CacheManager {
    store: Arc<CacheStore>,
    metrics: Arc<MetricsRegistry>,
    inflight: Mutex<HashMap<String, LoadSlot>>,
}

impl CacheManager {
    /// Wrap a store
    pub fn new(store: Arc<CacheStore>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            store,
            metrics,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Return the cached value or run `loader` exactly once across all
    /// concurrent callers of this key
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        kind: CacheKind,
        loader: F,
    ) -> AppResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<Value>>,
    {
        let started = Instant::now();
        let prefix = key_prefix(key);

        match self.store.get(key).await {
            Ok(Some(value)) => {
                let elapsed = started.elapsed();
                self.metrics.cache.record_hit(prefix, elapsed);
                self.metrics.cache_latency.record(elapsed);
                return Ok(value);
            }
            Ok(None) => {}
            Err(err) => warn!(key, error = %err, "cache read failed, falling through"),
        }

        enum Role {
            Leader(watch::Sender<Option<AppResult<Value>>>),
            Follower(LoadSlot),
        }

        let role = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(key) {
                Some(slot) => Role::Follower(slot.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        let result = match role {
            Role::Leader(tx) => {
                debug!(key, "cache miss, loading");
                let result = loader().await;

                if let Ok(value) = &result {
                    // Fill errors never fail the read.
                    if let Err(err) = self.store.set(key, value.clone(), kind).await {
                        warn!(key, error = %err, "cache fill failed");
                    }
                }

                self.inflight.lock().await.remove(key);
                let _ = tx.send(Some(result.clone()));
                result
            }
            Role::Follower(mut slot) => {
                let outcome = slot
                    .wait_for(|v| v.is_some())
                    .await
                    .map_err(|_| AppError::Internal("shared load abandoned".to_string()))?;
                (*outcome)
                    .clone()
                    .expect("wait_for only returns once the slot is filled")
            }
        };

        let elapsed = started.elapsed();
        self.metrics.cache.record_miss(prefix, elapsed);
        self.metrics.upstream_latency.record(elapsed);
        result
    }

    /// Populate the hot working set: the calendar window around today plus
    /// every member, team, project and client. All loads run at low
    /// priority.
    pub async fn warmup(&self, api: &dyn UpstreamApi) -> WarmupReport {
        let started = Instant::now();
        let mut report = WarmupReport::default();

        let (window_start, window_end) = keys::hot_calendar_window();
        let query = TaskRangeQuery {
            start: window_start.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            end: window_end.and_hms_opt(23, 59, 59).map(|dt| dt.and_utc()),
            ..TaskRangeQuery::default()
        };

        match api.query_tasks(&query, PRIORITY_LOW).await {
            Ok(tasks) => {
                report.tasks = tasks.len();
                if let Ok(value) = serde_json::to_value(&tasks) {
                    let _ = self
                        .store
                        .set(&keys::hot_calendar_key(), value, CacheKind::CalendarRange)
                        .await;
                }
                for task in &tasks {
                    if let Ok(value) = serde_json::to_value(task) {
                        let _ = self
                            .store
                            .set(
                                &keys::entity_key(EntityKind::Task, &task.id),
                                value,
                                CacheKind::Entity(EntityKind::Task),
                            )
                            .await;
                    }
                }
            }
            Err(err) => report.errors.push(format!("calendar window: {}", err)),
        }

        for kind in [
            EntityKind::Member,
            EntityKind::Team,
            EntityKind::Project,
            EntityKind::Client,
        ] {
            match api.list_entities(kind, &ListFilter::default(), PRIORITY_LOW).await {
                Ok(entities) => {
                    report
                        .entities
                        .insert(kind.prefix().to_string(), entities.len());
                    if let Ok(value) = serde_json::to_value(&entities) {
                        let _ = self
                            .store
                            .set(&keys::list_key(kind), value, CacheKind::Entity(kind))
                            .await;
                    }
                    for entity in &entities {
                        if let Ok(value) = serde_json::to_value(entity) {
                            let _ = self
                                .store
                                .set(
                                    &keys::entity_key(kind, &entity.id),
                                    value,
                                    CacheKind::Entity(kind),
                                )
                                .await;
                        }
                    }
                }
                Err(err) => report.errors.push(format!("{}: {}", kind, err)),
            }
        }

        info!(
            tasks = report.tasks,
            errors = report.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache warmup finished"
        );
        report
    }

    /// Read a key only if it currently holds an array; no loader, no fill
    pub async fn peek_array(&self, key: &str) -> Option<Vec<Value>> {
        match self.store.get(key).await {
            Ok(Some(Value::Array(items))) => Some(items),
            _ => None,
        }
    }

    /// Record a read-through write performed outside `get_or_fetch`
    pub async fn fill(&self, key: &str, value: Value, kind: CacheKind) {
        if let Err(err) = self.store.set(key, value, kind).await {
            warn!(key, error = %err, "cache fill failed");
        }
    }

    /// Placeholder value stored for tombstoned reads
    pub fn tombstone_value(id: &str) -> Value {
        json!({ "id": id, "_deleted": true, "_pendingSync": true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::{sleep, Duration};

    fn manager() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(
            Arc::new(CacheStore::memory()),
            Arc::new(MetricsRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn test_hit_skips_loader() {
        let manager = manager();
        manager
            .store()
            .set("task:1", json!({"id": "1"}), CacheKind::Derived)
            .await
            .unwrap();

        let value = manager
            .get_or_fetch("task:1", CacheKind::Derived, || async {
                panic!("loader must not run on a hit")
            })
            .await
            .unwrap();
        assert_eq!(value, json!({"id": "1"}));
        assert_eq!(manager.metrics.cache.snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_miss_loads_and_fills() {
        let manager = manager();
        let value = manager
            .get_or_fetch("task:2", CacheKind::Derived, || async {
                Ok(json!({"id": "2"}))
            })
            .await
            .unwrap();
        assert_eq!(value, json!({"id": "2"}));
        assert_eq!(
            manager.store().get("task:2").await.unwrap(),
            Some(json!({"id": "2"}))
        );
        assert_eq!(manager.metrics.cache.snapshot().misses, 1);
    }

    #[tokio::test]
    async fn test_single_flight_under_contention() {
        let manager = manager();
        let invocations = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let manager = Arc::clone(&manager);
            let invocations = Arc::clone(&invocations);
            handles.push(tokio::spawn(async move {
                manager
                    .get_or_fetch("shared", CacheKind::Derived, move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok(json!("loaded"))
                    })
                    .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        for result in results {
            assert_eq!(result.unwrap().unwrap(), json!("loaded"));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loader_error_propagates_and_is_not_cached() {
        let manager = manager();
        let result = manager
            .get_or_fetch("task:bad", CacheKind::Derived, || async {
                Err(AppError::Upstream("500".to_string()))
            })
            .await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
        assert_eq!(manager.store().get("task:bad").await.unwrap(), None);

        // A later call runs the loader again (no negative caching).
        let value = manager
            .get_or_fetch("task:bad", CacheKind::Derived, || async { Ok(json!(1)) })
            .await
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn test_loader_error_reaches_all_waiters() {
        let manager = manager();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .get_or_fetch("failing", CacheKind::Derived, || async {
                        sleep(Duration::from_millis(30)).await;
                        Err(AppError::Timeout("slow".to_string()))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(AppError::Timeout(_))
            ));
        }
    }
}
