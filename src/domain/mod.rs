//! Domain model
//!
//! Entity shapes exchanged with the upstream, the cache overlay flags the
//! write pipeline maintains, persisted conflict records and sync-log rows.
//! Entities store only ids for their relations; back-references are never
//! serialized.

pub mod conflict;
pub mod entity;
pub mod sync_log;
pub mod task;

pub use conflict::{ConflictKind, ConflictRecord, DetectionMethod, Resolution, Severity};
pub use entity::EntityRecord;
pub use sync_log::{SyncLog, SyncMethod, SyncOutcome};
pub use task::{
    CachedTask, SyncFlags, SyncStatus, Task, TaskInput, TaskPatch, TaskStatus, TaskType,
    WorkPeriod,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The entity kinds this system fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A schedulable task (the richest kind)
    Task,
    /// A project tasks may belong to
    Project,
    /// A client projects belong to
    Client,
    /// A team member tasks are assigned to
    Member,
    /// A team grouping members
    Team,
}

impl EntityKind {
    /// Lowercase cache-key prefix for this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Project => "project",
            EntityKind::Client => "client",
            EntityKind::Member => "member",
            EntityKind::Team => "team",
        }
    }

    /// All kinds, in warmup order
    pub fn all() -> [EntityKind; 5] {
        [
            EntityKind::Task,
            EntityKind::Project,
            EntityKind::Client,
            EntityKind::Member,
            EntityKind::Team,
        ]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(EntityKind::Task),
            "project" => Ok(EntityKind::Project),
            "client" => Ok(EntityKind::Client),
            "member" => Ok(EntityKind::Member),
            "team" => Ok(EntityKind::Team),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}
