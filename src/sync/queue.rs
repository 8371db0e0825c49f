//! Asynchronous write queue
//!
//! Accepts create/update/delete intents without blocking the caller. A
//! create hands back a synthetic `temp_` id and writes an optimistic record
//! to the cache immediately; the worker later writes through to the upstream
//! and reconciles the id. Bounded FIFO: on overflow the oldest 10% of items
//! are evicted and reported.
//!
//! Ownership of an item is exclusive to the queue after enqueue; callers
//! hold no reference. Within one entity id, operations apply in enqueue
//! order because a single worker drains the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::keys::entity_key;
use crate::cache::{CacheKind, CacheStore};
use crate::domain::EntityKind;
use crate::error::{AppError, AppResult};
use crate::metrics::MetricsRegistry;

use super::events::{QueueOp, SyncEvent, SyncEvents};

/// Default queue bound
pub const DEFAULT_MAX_SIZE: usize = 100;

/// Default per-item retry limit
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One queued write intent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Item id
    pub id: String,
    /// Operation
    pub op: QueueOp,
    /// Entity kind
    pub kind: EntityKind,
    /// Target entity id (synthetic for creates)
    pub entity_id: String,
    /// Opaque payload: create data or update patch
    pub payload: Value,
    /// Attempts so far
    pub attempts: u32,
    /// Per-item retry limit
    pub max_retries: u32,
    /// When the item was enqueued
    pub created_at: DateTime<Utc>,
    /// Last processing attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Last failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueueItem {
    fn new(op: QueueOp, kind: EntityKind, entity_id: String, payload: Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            op,
            kind,
            entity_id,
            payload,
            attempts: 0,
            max_retries,
            created_at: Utc::now(),
            last_attempt: None,
            error: None,
        }
    }
}

pub(crate) struct QueueShared {
    pub(crate) items: Mutex<VecDeque<QueueItem>>,
    pub(crate) notify: Notify,
    pub(crate) processing: AtomicBool,
    pub(crate) max_size: usize,
}

/// Shallow-merge `patch`'s keys into `base` (objects only)
pub(crate) fn merge_into(base: &mut Value, patch: &Value) {
    if let (Value::Object(base), Value::Object(patch)) = (base, patch) {
        for (key, value) in patch {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Set or clear an overlay flag on a cached record
pub(crate) fn set_flag(value: &mut Value, flag: &str, on: bool) {
    if let Value::Object(map) = value {
        if on {
            map.insert(flag.to_string(), Value::Bool(true));
        } else {
            map.remove(flag);
        }
    }
}

/// The bounded write queue
pub struct SyncQueue {
    pub(crate) shared: Arc<QueueShared>,
    cache: Arc<CacheStore>,
    events: Arc<SyncEvents>,
    metrics: Arc<MetricsRegistry>,
    max_retries: u32,
}

impl SyncQueue {
    /// New queue with the default bounds
    pub fn new(
        cache: Arc<CacheStore>,
        events: Arc<SyncEvents>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self::with_limits(cache, events, metrics, DEFAULT_MAX_SIZE, DEFAULT_MAX_RETRIES)
    }

    /// New queue with explicit bounds
    pub fn with_limits(
        cache: Arc<CacheStore>,
        events: Arc<SyncEvents>,
        metrics: Arc<MetricsRegistry>,
        max_size: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                processing: AtomicBool::new(true),
                max_size,
            }),
            cache,
            events,
            metrics,
            max_retries,
        }
    }

    /// Enqueue a create; returns the synthetic id immediately
    ///
    /// The optimistic record lands in the cache before this returns, so
    /// reads observe it with `_temporary` and `_pendingSync` set.
    pub async fn enqueue_create(&self, kind: EntityKind, data: Value) -> AppResult<String> {
        let temp_id = format!("temp_{}", Uuid::new_v4().simple());

        let mut record = data.clone();
        if let Value::Object(map) = &mut record {
            map.insert("id".to_string(), Value::String(temp_id.clone()));
        } else {
            return Err(AppError::Validation("create payload must be an object".to_string()));
        }
        set_flag(&mut record, "_temporary", true);
        set_flag(&mut record, "_pendingSync", true);

        self.cache
            .set(&entity_key(kind, &temp_id), record, CacheKind::Entity(kind))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        self.push(QueueItem::new(
            QueueOp::Create,
            kind,
            temp_id.clone(),
            data,
            self.max_retries,
        ));
        Ok(temp_id)
    }

    /// Enqueue a partial update; the cached record gains the patch plus
    /// `_pendingSync` immediately
    pub async fn enqueue_update(&self, kind: EntityKind, id: &str, patch: Value) -> AppResult<()> {
        let key = entity_key(kind, id);
        let mut record = self
            .cache
            .get(&key)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .unwrap_or_else(|| {
                let mut map = Map::new();
                map.insert("id".to_string(), Value::String(id.to_string()));
                Value::Object(map)
            });

        merge_into(&mut record, &patch);
        set_flag(&mut record, "_pendingSync", true);
        set_flag(&mut record, "_syncError", false);
        if let Value::Object(map) = &mut record {
            map.remove("_syncErrorMsg");
        }

        self.cache
            .set(&key, record, CacheKind::Entity(kind))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        self.push(QueueItem::new(
            QueueOp::Update,
            kind,
            id.to_string(),
            patch,
            self.max_retries,
        ));
        Ok(())
    }

    /// Enqueue a delete; the cached record is tombstoned immediately
    pub async fn enqueue_delete(&self, kind: EntityKind, id: &str) -> AppResult<()> {
        let key = entity_key(kind, id);
        let mut record = self
            .cache
            .get(&key)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .unwrap_or_else(|| {
                let mut map = Map::new();
                map.insert("id".to_string(), Value::String(id.to_string()));
                Value::Object(map)
            });

        set_flag(&mut record, "_deleted", true);
        set_flag(&mut record, "_pendingSync", true);

        self.cache
            .set(&key, record, CacheKind::Entity(kind))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        self.push(QueueItem::new(
            QueueOp::Delete,
            kind,
            id.to_string(),
            Value::Null,
            self.max_retries,
        ));
        Ok(())
    }

    /// Append an item, evicting the oldest 10% on overflow
    pub(crate) fn push(&self, item: QueueItem) {
        let mut items = self.shared.items.lock();
        if items.len() >= self.shared.max_size {
            let evict = (self.shared.max_size / 10).max(1);
            for _ in 0..evict {
                if let Some(victim) = items.pop_front() {
                    warn!(
                        item_id = %victim.id,
                        entity_id = %victim.entity_id,
                        "queue overflow, dropping oldest item"
                    );
                    self.metrics.queue.record_dropped();
                    self.events.emit(SyncEvent::ItemDropped {
                        item_id: victim.id,
                        entity_id: victim.entity_id,
                    });
                }
            }
        }
        items.push_back(item);
        drop(items);
        self.shared.notify.notify_one();
    }

    /// Pending items
    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of pending items for observability
    pub fn status(&self) -> Vec<QueueItem> {
        self.shared.items.lock().iter().cloned().collect()
    }

    /// Drop every pending item without rollback (operator action)
    pub fn clear_queue(&self) -> usize {
        let drained = {
            let mut items = self.shared.items.lock();
            let count = items.len();
            items.clear();
            count
        };
        if drained > 0 {
            info!(items = drained, "sync queue cleared");
            self.events.emit(SyncEvent::QueueCleared { items: drained });
        }
        drained
    }

    /// Signal the worker to stop after its current item
    pub fn stop(&self) {
        self.shared.processing.store(false, Ordering::SeqCst);
        // notify_one stores a permit so a worker that has not yet parked
        // still observes the stop.
        self.shared.notify.notify_one();
        self.shared.notify.notify_waiters();
    }

    /// Whether the worker should keep running
    pub fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::SeqCst)
    }

    /// Event stream handle
    pub fn events(&self) -> &Arc<SyncEvents> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> SyncQueue {
        SyncQueue::new(
            Arc::new(CacheStore::memory()),
            Arc::new(SyncEvents::new()),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_create_returns_temp_id_and_writes_optimistic_record() {
        let queue = queue();
        let temp_id = queue
            .enqueue_create(EntityKind::Task, json!({"title": "A"}))
            .await
            .unwrap();
        assert!(temp_id.starts_with("temp_"));

        let cached = queue
            .cache
            .get(&entity_key(EntityKind::Task, &temp_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached["title"], "A");
        assert_eq!(cached["id"], json!(temp_id));
        assert_eq!(cached["_temporary"], json!(true));
        assert_eq!(cached["_pendingSync"], json!(true));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_patch_into_cached_record() {
        let queue = queue();
        queue
            .cache
            .set(
                "task:t1",
                json!({"id": "t1", "title": "old", "notes": "keep"}),
                CacheKind::Entity(EntityKind::Task),
            )
            .await
            .unwrap();

        queue
            .enqueue_update(EntityKind::Task, "t1", json!({"title": "new"}))
            .await
            .unwrap();

        let cached = queue.cache.get("task:t1").await.unwrap().unwrap();
        assert_eq!(cached["title"], "new");
        assert_eq!(cached["notes"], "keep");
        assert_eq!(cached["_pendingSync"], json!(true));
    }

    #[tokio::test]
    async fn test_delete_tombstones_cached_record() {
        let queue = queue();
        queue
            .cache
            .set("task:t1", json!({"id": "t1"}), CacheKind::Entity(EntityKind::Task))
            .await
            .unwrap();

        queue.enqueue_delete(EntityKind::Task, "t1").await.unwrap();

        let cached = queue.cache.get("task:t1").await.unwrap().unwrap();
        assert_eq!(cached["_deleted"], json!(true));
        assert_eq!(cached["_pendingSync"], json!(true));
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest_tenth() {
        let cache = Arc::new(CacheStore::memory());
        let events = Arc::new(SyncEvents::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let queue = SyncQueue::with_limits(cache, Arc::clone(&events), Arc::clone(&metrics), 10, 3);
        let mut rx = events.subscribe();

        for i in 0..11 {
            queue
                .enqueue_update(EntityKind::Task, &format!("t{}", i), json!({"n": i}))
                .await
                .unwrap();
        }

        // 10 items filled the queue; the 11th evicted the oldest one.
        assert_eq!(queue.len(), 10);
        assert!(matches!(
            rx.try_recv().unwrap(),
            SyncEvent::ItemDropped { .. }
        ));
        assert_eq!(metrics.queue.snapshot().dropped, 1);

        let pending = queue.status();
        assert_eq!(pending[0].entity_id, "t1");
    }

    #[tokio::test]
    async fn test_clear_queue_discards_without_rollback() {
        let queue = queue();
        for i in 0..3 {
            queue
                .enqueue_update(EntityKind::Task, &format!("t{}", i), json!({}))
                .await
                .unwrap();
        }
        assert_eq!(queue.clear_queue(), 3);
        assert!(queue.is_empty());

        // The optimistic cache overlay is untouched.
        let cached = queue.cache.get("task:t0").await.unwrap().unwrap();
        assert_eq!(cached["_pendingSync"], json!(true));
    }

    #[test]
    fn test_merge_into_is_shallow() {
        let mut base = json!({"a": 1, "b": {"x": 1}});
        merge_into(&mut base, &json!({"b": {"y": 2}, "c": 3}));
        assert_eq!(base, json!({"a": 1, "b": {"y": 2}, "c": 3}));
    }
}
