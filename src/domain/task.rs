//! Task entity and its cache overlay
//!
//! A [`Task`] is the richest upstream entity: it carries a work period, an
//! ordered set of assigned member ids and scheduling metadata. Cached copies
//! are wrapped in [`CachedTask`], which flattens the write-pipeline flags
//! (`_temporary`, `_pendingSync`, `_deleted`, `_syncError`, `_syncErrorMsg`)
//! into the serialized record.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Task classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A regular billable task
    #[default]
    Task,
    /// Member is on holiday
    Holiday,
    /// Member is in training
    School,
    /// Member works remotely
    Remote,
}

/// Task progress status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started yet
    #[default]
    NotStarted,
    /// Currently in progress
    InProgress,
    /// Completed
    Completed,
}

/// The date interval a task occupies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkPeriod {
    /// Inclusive start
    pub start_date: DateTime<Utc>,
    /// Inclusive end
    pub end_date: DateTime<Utc>,
}

impl WorkPeriod {
    /// Whether two periods overlap (half-open interval comparison)
    pub fn overlaps(&self, other: &WorkPeriod) -> bool {
        self.start_date < other.end_date && other.start_date < self.end_date
    }

    /// Calendar days covered by the period, inclusive
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut day = self.start_date.date_naive();
        let last = self.end_date.date_naive();
        while day <= last {
            days.push(day);
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        days
    }
}

/// A task as exposed by this system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Upstream id, or a synthetic `temp_` id while a create is in flight
    pub id: String,

    /// Title
    pub title: String,

    /// Occupied date interval, if scheduled
    #[serde(default)]
    pub work_period: Option<WorkPeriod>,

    /// Assigned member ids, in upstream order
    #[serde(default)]
    pub assigned_members: Vec<String>,

    /// Owning project id
    #[serde(default)]
    pub project_id: Option<String>,

    /// Task classification
    #[serde(default)]
    pub task_type: TaskType,

    /// Progress status
    #[serde(default)]
    pub status: TaskStatus,

    /// Hours billed to the client
    #[serde(default)]
    pub billed_hours: f64,

    /// Hours actually spent
    #[serde(default)]
    pub actual_hours: f64,

    /// Whether the task shows on the shared calendar
    #[serde(default)]
    pub add_to_calendar: bool,

    /// Whether the task counts toward client planning
    #[serde(default)]
    pub client_planning: bool,

    /// Free-text notes
    #[serde(default)]
    pub notes: Option<String>,

    /// Upstream creation time
    pub created_at: DateTime<Utc>,

    /// Upstream last-modified time; the optimistic-concurrency anchor
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    /// Title (required)
    pub title: String,
    /// Occupied date interval
    #[serde(default)]
    pub work_period: Option<WorkPeriod>,
    /// Assigned member ids
    #[serde(default)]
    pub assigned_members: Vec<String>,
    /// Owning project id
    #[serde(default)]
    pub project_id: Option<String>,
    /// Task classification
    #[serde(default)]
    pub task_type: TaskType,
    /// Progress status
    #[serde(default)]
    pub status: TaskStatus,
    /// Hours billed to the client
    #[serde(default)]
    pub billed_hours: f64,
    /// Hours actually spent
    #[serde(default)]
    pub actual_hours: f64,
    /// Whether the task shows on the shared calendar
    #[serde(default)]
    pub add_to_calendar: bool,
    /// Whether the task counts toward client planning
    #[serde(default)]
    pub client_planning: bool,
    /// Free-text notes
    #[serde(default)]
    pub notes: Option<String>,
}

/// Partial update overlay; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    /// New title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New work period; `Some(None)` clears it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_period: Option<Option<WorkPeriod>>,
    /// New member assignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_members: Option<Vec<String>>,
    /// New owning project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Option<String>>,
    /// New classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    /// New status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// New billed hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billed_hours: Option<f64>,
    /// New actual hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
    /// New calendar visibility
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_to_calendar: Option<bool>,
    /// New client-planning flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_planning: Option<bool>,
    /// New notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    /// Optimistic-concurrency anchor; compared against the current upstream
    /// `updatedAt` before the write is accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    /// Apply the patch to a task, producing the merged candidate
    pub fn apply_to(&self, task: &Task) -> Task {
        let mut merged = task.clone();
        if let Some(title) = &self.title {
            merged.title = title.clone();
        }
        if let Some(period) = &self.work_period {
            merged.work_period = period.clone();
        }
        if let Some(members) = &self.assigned_members {
            merged.assigned_members = members.clone();
        }
        if let Some(project) = &self.project_id {
            merged.project_id = project.clone();
        }
        if let Some(task_type) = self.task_type {
            merged.task_type = task_type;
        }
        if let Some(status) = self.status {
            merged.status = status;
        }
        if let Some(hours) = self.billed_hours {
            merged.billed_hours = hours;
        }
        if let Some(hours) = self.actual_hours {
            merged.actual_hours = hours;
        }
        if let Some(flag) = self.add_to_calendar {
            merged.add_to_calendar = flag;
        }
        if let Some(flag) = self.client_planning {
            merged.client_planning = flag;
        }
        if let Some(notes) = &self.notes {
            merged.notes = notes.clone();
        }
        merged
    }

    /// Whether the patch touches scheduling-relevant fields
    pub fn touches_schedule(&self) -> bool {
        self.work_period.is_some() || self.assigned_members.is_some()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Write-pipeline flags flattened into cached records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFlags {
    /// The id is synthetic; the create has not confirmed yet
    #[serde(rename = "_temporary", default, skip_serializing_if = "is_false")]
    pub temporary: bool,

    /// A queued write for this entity is in flight
    #[serde(rename = "_pendingSync", default, skip_serializing_if = "is_false")]
    pub pending_sync: bool,

    /// Tombstone while an async delete is in flight
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    /// The last queued write for this entity failed terminally
    #[serde(rename = "_syncError", default, skip_serializing_if = "is_false")]
    pub sync_error: bool,

    /// Cause of the terminal failure
    #[serde(
        rename = "_syncErrorMsg",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sync_error_msg: Option<String>,
}

impl SyncFlags {
    /// Flags for a freshly enqueued optimistic create
    pub fn optimistic_create() -> Self {
        Self {
            temporary: true,
            pending_sync: true,
            ..Self::default()
        }
    }

    /// Flags for an enqueued update
    pub fn pending() -> Self {
        Self {
            pending_sync: true,
            ..Self::default()
        }
    }

    /// Flags for an enqueued delete
    pub fn tombstone() -> Self {
        Self {
            deleted: true,
            pending_sync: true,
            ..Self::default()
        }
    }
}

/// A task as stored in the cache: the entity plus overlay flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTask {
    /// The task itself
    #[serde(flatten)]
    pub task: Task,
    /// Write-pipeline overlay
    #[serde(flatten)]
    pub flags: SyncFlags,
}

impl CachedTask {
    /// Wrap a confirmed upstream task (no flags set)
    pub fn confirmed(task: Task) -> Self {
        Self {
            task,
            flags: SyncFlags::default(),
        }
    }
}

/// Per-entity sync summary exposed on read responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// A queued write is still in flight
    pub pending: bool,
    /// The id is synthetic
    pub temporary: bool,
    /// Tombstoned by an in-flight delete
    pub deleted: bool,
    /// Terminal-failure message, if the last write failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&SyncFlags> for SyncStatus {
    fn from(flags: &SyncFlags) -> Self {
        Self {
            pending: flags.pending_sync,
            temporary: flags.temporary,
            deleted: flags.deleted,
            error: flags.sync_error_msg.clone(),
        }
    }
}
