//! Asynchronous write pipeline
//!
//! - `queue`: bounded intent queue with optimistic cache writes
//! - `worker`: the single drain loop with retry, rollback and events
//! - `events`: the typed multi-subscriber event channel
//!
//! The reconciler below subscribes to the event stream and rewrites
//! persisted conflict rows when a synthetic id is replaced by the confirmed
//! upstream id.

pub mod events;
pub mod queue;
pub mod worker;

pub use events::{QueueOp, SyncEvent, SyncEvents};
pub use queue::{QueueItem, SyncQueue, DEFAULT_MAX_RETRIES, DEFAULT_MAX_SIZE};
pub use worker::{SyncWorker, WORKER_GAP};

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::conflict::ConflictStore;

/// Subscribe to the event stream and keep dependent state consistent with
/// id reconciliation
pub fn spawn_reconciler(
    events: &SyncEvents,
    conflicts: Arc<dyn ConflictStore>,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::Created {
                    temp_id, real_id, ..
                }) => {
                    if let Err(err) = conflicts.reassign_task(&temp_id, &real_id).await {
                        warn!(
                            temp_id,
                            real_id,
                            error = %err,
                            "conflict reassignment failed"
                        );
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "reconciler lagged behind the event stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
