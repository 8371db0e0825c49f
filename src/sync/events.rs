//! Write-pipeline events
//!
//! The queue publishes typed events on a multi-subscriber channel as items
//! resolve. Subscribers include the temp-to-real id rewriter, the conflict
//! persister and the metrics sidecar. Events are emitted in completion
//! order.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::EntityKind;

/// Channel capacity; slow subscribers lag rather than block the worker
const EVENT_CAPACITY: usize = 1_024;

/// Queue operation kind, as carried in events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOp {
    /// Create a new entity
    Create,
    /// Patch an existing entity
    Update,
    /// Soft-delete an entity
    Delete,
}

impl QueueOp {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOp::Create => "create",
            QueueOp::Update => "update",
            QueueOp::Delete => "delete",
        }
    }
}

/// Events published by the write pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A create confirmed; the synthetic id was replaced
    Created {
        /// Entity kind
        kind: EntityKind,
        /// The synthetic id handed to the caller
        temp_id: String,
        /// The confirmed upstream id
        real_id: String,
    },
    /// An update confirmed
    Updated {
        /// Entity kind
        kind: EntityKind,
        /// Entity id
        id: String,
    },
    /// A delete confirmed
    Deleted {
        /// Entity kind
        kind: EntityKind,
        /// Entity id
        id: String,
    },
    /// An item failed terminally and was compensated
    ItemFailed {
        /// Entity kind
        kind: EntityKind,
        /// Operation that failed
        op: QueueOp,
        /// Entity id the item targeted
        entity_id: String,
        /// Cause
        error: String,
    },
    /// An item was evicted on queue overflow
    ItemDropped {
        /// Queue item id
        item_id: String,
        /// Entity id the item targeted
        entity_id: String,
    },
    /// The queue was cleared by an operator
    QueueCleared {
        /// Items discarded
        items: usize,
    },
}

/// Multi-subscriber event channel
pub struct SyncEvents {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncEvents {
    /// New channel
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event; silently dropped when nobody subscribes
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the stream
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for SyncEvents {
    fn default() -> Self {
        Self::new()
    }
}
