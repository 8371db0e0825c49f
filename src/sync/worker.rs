//! Queue worker
//!
//! A single dedicated loop drains the write queue: pop, apply against the
//! upstream, reconcile the cache, publish the matching event. Retryable
//! failures requeue with exponential backoff; terminal failures roll the
//! cache back through one `compensate` path keyed on the operation.
//!
//! The worker sleeps a fixed gap between iterations to respect upstream
//! pacing and blocks when the queue is empty. `stop` lets it finish the
//! current item and exit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cache::keys::{calendar_pattern, entity_key};
use crate::cache::{CacheKind, CacheStore};
use crate::domain::{CachedTask, EntityKind, TaskInput, TaskPatch};
use crate::metrics::MetricsRegistry;
use crate::upstream::client::UpstreamApi;
use crate::upstream::limiter::PRIORITY_NORMAL;
use crate::upstream::retry::backoff_delay;
use crate::upstream::{UpstreamError, UpstreamResult};

use super::events::{QueueOp, SyncEvent};
use super::queue::{set_flag, QueueItem, SyncQueue};

/// Pause between worker iterations while the queue is non-empty
pub const WORKER_GAP: Duration = Duration::from_millis(350);

/// Base delay for requeue backoff
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// The single write-pipeline worker
pub struct SyncWorker {
    queue: Arc<SyncQueue>,
    upstream: Arc<dyn UpstreamApi>,
    cache: Arc<CacheStore>,
    metrics: Arc<MetricsRegistry>,
    gap: Duration,
}

impl SyncWorker {
    /// Build a worker over the queue's shared state
    pub fn new(
        queue: Arc<SyncQueue>,
        upstream: Arc<dyn UpstreamApi>,
        cache: Arc<CacheStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            queue,
            upstream,
            cache,
            metrics,
            gap: WORKER_GAP,
        }
    }

    /// Run on a dedicated task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// The worker loop
    pub async fn run(self) {
        info!("sync worker started");
        while self.queue.is_processing() {
            let item = self.queue.shared.items.lock().pop_front();
            let Some(mut item) = item else {
                self.queue.shared.notify.notified().await;
                continue;
            };

            self.process(&mut item).await;

            if !self.queue.is_empty() {
                tokio::time::sleep(self.gap).await;
            }
        }
        info!("sync worker stopped");
    }

    async fn process(&self, item: &mut QueueItem) {
        item.attempts += 1;
        item.last_attempt = Some(Utc::now());
        let started = Instant::now();

        match self.apply(item).await {
            Ok(()) => {
                self.metrics.queue.record_processed(started.elapsed());
            }
            Err(err) if err.is_retryable() && item.attempts < item.max_retries => {
                let delay = backoff_delay(BACKOFF_BASE, item.attempts);
                warn!(
                    item_id = %item.id,
                    entity_id = %item.entity_id,
                    attempt = item.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "sync item failed, requeueing with backoff"
                );
                item.error = Some(err.to_string());
                self.metrics.queue.record_retry();

                // Requeue appends, preserving per-id FIFO for later intents.
                let queue = Arc::clone(&self.queue);
                let item = item.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if queue.is_processing() {
                        queue.push(item);
                    }
                });
            }
            Err(err) => {
                error!(
                    item_id = %item.id,
                    entity_id = %item.entity_id,
                    attempts = item.attempts,
                    error = %err,
                    "sync item failed terminally, rolling back"
                );
                item.error = Some(err.to_string());
                self.compensate(item, &err).await;
                self.metrics.queue.record_failed(started.elapsed());
                self.metrics.activity.record_error(err.to_string());
                self.queue.events().emit(SyncEvent::ItemFailed {
                    kind: item.kind,
                    op: item.op,
                    entity_id: item.entity_id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    async fn apply(&self, item: &QueueItem) -> UpstreamResult<()> {
        match item.op {
            QueueOp::Create => self.apply_create(item).await,
            QueueOp::Update => self.apply_update(item).await,
            QueueOp::Delete => self.apply_delete(item).await,
        }
    }

    async fn apply_create(&self, item: &QueueItem) -> UpstreamResult<()> {
        let (real_id, record) = match item.kind {
            EntityKind::Task => {
                let input: TaskInput = serde_json::from_value(item.payload.clone())
                    .map_err(|e| UpstreamError::SchemaMismatch(e.to_string()))?;
                let task = self.upstream.create_task(&input, PRIORITY_NORMAL).await?;
                let id = task.id.clone();
                let record = serde_json::to_value(CachedTask::confirmed(task))
                    .map_err(|e| UpstreamError::SchemaMismatch(e.to_string()))?;
                (id, record)
            }
            kind => {
                let entity = self
                    .upstream
                    .create_entity(kind, item.payload.clone(), PRIORITY_NORMAL)
                    .await?;
                let id = entity.id.clone();
                let record = serde_json::to_value(entity)
                    .map_err(|e| UpstreamError::SchemaMismatch(e.to_string()))?;
                (id, record)
            }
        };

        // The synthetic record disappears in the same step the confirmed one
        // lands, so readers never see both.
        self.cache_del(&entity_key(item.kind, &item.entity_id)).await;
        self.cache_set(&entity_key(item.kind, &real_id), record, item.kind)
            .await;
        self.invalidate_derived(item.kind).await;

        self.queue.events().emit(SyncEvent::Created {
            kind: item.kind,
            temp_id: item.entity_id.clone(),
            real_id,
        });
        Ok(())
    }

    async fn apply_update(&self, item: &QueueItem) -> UpstreamResult<()> {
        let record = match item.kind {
            EntityKind::Task => {
                let patch: TaskPatch = serde_json::from_value(item.payload.clone())
                    .map_err(|e| UpstreamError::SchemaMismatch(e.to_string()))?;
                let task = self
                    .upstream
                    .update_task(&item.entity_id, &patch, PRIORITY_NORMAL)
                    .await?;
                serde_json::to_value(CachedTask::confirmed(task))
                    .map_err(|e| UpstreamError::SchemaMismatch(e.to_string()))?
            }
            kind => {
                let entity = self
                    .upstream
                    .update_entity(kind, &item.entity_id, item.payload.clone(), PRIORITY_NORMAL)
                    .await?;
                serde_json::to_value(entity)
                    .map_err(|e| UpstreamError::SchemaMismatch(e.to_string()))?
            }
        };

        self.cache_set(&entity_key(item.kind, &item.entity_id), record, item.kind)
            .await;
        self.invalidate_derived(item.kind).await;

        self.queue.events().emit(SyncEvent::Updated {
            kind: item.kind,
            id: item.entity_id.clone(),
        });
        Ok(())
    }

    async fn apply_delete(&self, item: &QueueItem) -> UpstreamResult<()> {
        self.upstream
            .archive_entity(item.kind, &item.entity_id, PRIORITY_NORMAL)
            .await?;

        self.cache_del(&entity_key(item.kind, &item.entity_id)).await;
        self.invalidate_derived(item.kind).await;

        self.queue.events().emit(SyncEvent::Deleted {
            kind: item.kind,
            id: item.entity_id.clone(),
        });
        Ok(())
    }

    /// Roll the cache back after a terminal failure, keyed on the operation
    async fn compensate(&self, item: &QueueItem, cause: &UpstreamError) {
        let key = entity_key(item.kind, &item.entity_id);
        match item.op {
            // The synthetic id never existed upstream; the optimistic record
            // simply disappears.
            QueueOp::Create => self.cache_del(&key).await,
            // The optimistic overlay stays visible but flagged.
            QueueOp::Update => self.flag_error(&key, item.kind, cause, false).await,
            // The entity reappears in reads until an operator intervenes.
            QueueOp::Delete => self.flag_error(&key, item.kind, cause, true).await,
        }
    }

    async fn flag_error(&self, key: &str, kind: EntityKind, cause: &UpstreamError, undelete: bool) {
        let record = match self.cache.get(key).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "rollback read failed");
                None
            }
        };
        let Some(mut record) = record else {
            return;
        };

        set_flag(&mut record, "_pendingSync", false);
        set_flag(&mut record, "_syncError", true);
        if undelete {
            set_flag(&mut record, "_deleted", false);
        }
        if let Value::Object(map) = &mut record {
            map.insert(
                "_syncErrorMsg".to_string(),
                Value::String(cause.to_string()),
            );
        }
        self.cache_set(key, record, kind).await;
    }

    async fn cache_set(&self, key: &str, value: Value, kind: EntityKind) {
        if let Err(err) = self.cache.set(key, value, CacheKind::Entity(kind)).await {
            warn!(key, error = %err, "cache write failed after sync");
        }
    }

    async fn cache_del(&self, key: &str) {
        if let Err(err) = self.cache.del(key).await {
            warn!(key, error = %err, "cache delete failed after sync");
        }
    }

    /// Derived keys that embed this kind's data
    async fn invalidate_derived(&self, kind: EntityKind) {
        if kind == EntityKind::Task {
            if let Err(err) = self.cache.invalidate_pattern(&calendar_pattern()).await {
                warn!(error = %err, "calendar invalidation failed");
            }
        }
    }
}
