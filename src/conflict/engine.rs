//! Conflict detection rules and persistence
//!
//! Rule set, per assigned member of the candidate task, over the member's
//! other tasks whose work period overlaps the candidate's:
//!
//! - a colliding holiday reports severity high
//! - a colliding training block reports severity medium
//! - any other collision reports an overlap, high when both sides are
//!   regular tasks, medium otherwise
//! - more than the allowed number of concurrent regular tasks on any single
//!   day reports an overload, severity medium
//!
//! "Same task" means id equality; update candidates carry their original id
//! so they never collide with themselves.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::keys::hot_calendar_key;
use crate::cache::CacheStore;
use crate::domain::{
    ConflictKind, ConflictRecord, DetectionMethod, Severity, Task, TaskInput, TaskPatch, TaskType,
    WorkPeriod,
};
use crate::error::AppResult;
use crate::upstream::client::{TaskRangeQuery, UpstreamApi};
use crate::upstream::limiter::PRIORITY_HIGH;

/// Default concurrent regular-task allowance per member-day
pub const DEFAULT_OVERLOAD_THRESHOLD: usize = 1;

/// Persistence seam for detected conflict sets
///
/// The document-store repository implements this; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait ConflictStore: Send + Sync {
    /// Atomically replace the persisted set for a task (delete-then-insert
    /// as one logical step)
    async fn replace_for_task(&self, task_id: &str, records: &[ConflictRecord]) -> AppResult<()>;

    /// Drop the persisted set for a task
    async fn clear_for_task(&self, task_id: &str) -> AppResult<()>;

    /// Unresolved records for a task
    async fn list_for_task(&self, task_id: &str) -> AppResult<Vec<ConflictRecord>>;

    /// Move records from a synthetic id to the confirmed upstream id
    async fn reassign_task(&self, old_id: &str, new_id: &str) -> AppResult<()>;
}

/// The task shape conflict detection works on; for updates it is the cached
/// task merged with the incoming patch
#[derive(Debug, Clone, Default)]
pub struct TaskCandidate {
    /// Original id for updates, absent for creates
    pub id: Option<String>,
    /// Proposed work period
    pub work_period: Option<WorkPeriod>,
    /// Proposed member assignment
    pub assigned_members: Vec<String>,
    /// Proposed type
    pub task_type: TaskType,
}

impl TaskCandidate {
    /// Candidate for a create intent
    pub fn from_input(input: &TaskInput) -> Self {
        Self {
            id: None,
            work_period: input.work_period.clone(),
            assigned_members: input.assigned_members.clone(),
            task_type: input.task_type,
        }
    }

    /// Candidate for an update: the current task with the patch applied,
    /// carrying the original id
    pub fn from_update(current: &Task, patch: &TaskPatch) -> Self {
        let merged = patch.apply_to(current);
        Self {
            id: Some(current.id.clone()),
            work_period: merged.work_period,
            assigned_members: merged.assigned_members,
            task_type: merged.task_type,
        }
    }
}

/// Detection result plus the sourcing method tag, so callers can tell "no
/// conflicts" from "could not check"
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    /// Detected conflicts, full snapshot
    pub conflicts: Vec<ConflictRecord>,
    /// Where the candidate set came from
    pub method: DetectionMethod,
}

/// The conflict detection engine
pub struct ConflictEngine {
    cache: Arc<CacheStore>,
    upstream: Arc<dyn UpstreamApi>,
    store: Arc<dyn ConflictStore>,
    overload_threshold: usize,
}

impl ConflictEngine {
    /// Build an engine with the default overload threshold
    pub fn new(
        cache: Arc<CacheStore>,
        upstream: Arc<dyn UpstreamApi>,
        store: Arc<dyn ConflictStore>,
    ) -> Self {
        Self {
            cache,
            upstream,
            store,
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
        }
    }

    /// Override the concurrent-task allowance
    pub fn with_overload_threshold(mut self, threshold: usize) -> Self {
        self.overload_threshold = threshold;
        self
    }

    /// Detect conflicts for a candidate task
    pub async fn detect(&self, candidate: &TaskCandidate) -> DetectionOutcome {
        let Some(period) = &candidate.work_period else {
            return DetectionOutcome {
                conflicts: Vec::new(),
                method: DetectionMethod::Cache,
            };
        };
        if candidate.assigned_members.is_empty() {
            return DetectionOutcome {
                conflicts: Vec::new(),
                method: DetectionMethod::Cache,
            };
        }

        let (others, method) = self.candidate_set(period).await;
        let conflicts = match method {
            DetectionMethod::None => Vec::new(),
            _ => self.run_rules(candidate, period, &others),
        };
        DetectionOutcome { conflicts, method }
    }

    /// Tasks that might collide with the period, cache first
    async fn candidate_set(&self, period: &WorkPeriod) -> (Vec<Task>, DetectionMethod) {
        let hot_key = hot_calendar_key();
        match self.cache.get(&hot_key).await {
            Ok(Some(Value::Array(items))) => {
                let tasks = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value::<Task>(item).ok())
                    .collect();
                return (tasks, DetectionMethod::Cache);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "hot range read failed"),
        }

        // Cache miss: rate-limited upstream range query at high priority.
        // The result is used once and deliberately not written back.
        let query = TaskRangeQuery {
            start: Some(period.start_date),
            end: Some(period.end_date),
            ..TaskRangeQuery::default()
        };
        match self.upstream.query_tasks(&query, PRIORITY_HIGH).await {
            Ok(tasks) => (tasks, DetectionMethod::NotionHybrid),
            Err(err) => {
                warn!(error = %err, "conflict range query failed, reporting unchecked");
                (Vec::new(), DetectionMethod::None)
            }
        }
    }

    fn run_rules(
        &self,
        candidate: &TaskCandidate,
        period: &WorkPeriod,
        others: &[Task],
    ) -> Vec<ConflictRecord> {
        let mut conflicts = Vec::new();
        let task_id = candidate.id.as_deref().unwrap_or("");

        for member in &candidate.assigned_members {
            let colliding: Vec<&Task> = others
                .iter()
                .filter(|other| {
                    Some(other.id.as_str()) != candidate.id.as_deref()
                        && other.assigned_members.iter().any(|m| m == member)
                        && other
                            .work_period
                            .as_ref()
                            .is_some_and(|p| p.overlaps(period))
                })
                .collect();

            for other in &colliding {
                let record = match other.task_type {
                    TaskType::Holiday => ConflictRecord::new(
                        task_id,
                        ConflictKind::Holiday,
                        Severity::High,
                        format!("{} is on holiday during the proposed period", member),
                    ),
                    TaskType::School => ConflictRecord::new(
                        task_id,
                        ConflictKind::School,
                        Severity::Medium,
                        format!("{} is in training during the proposed period", member),
                    ),
                    _ => {
                        let severity = if other.task_type == TaskType::Task
                            && candidate.task_type == TaskType::Task
                        {
                            Severity::High
                        } else {
                            Severity::Medium
                        };
                        ConflictRecord::new(
                            task_id,
                            ConflictKind::Overlap,
                            severity,
                            format!("overlaps \"{}\" for {}", other.title, member),
                        )
                    }
                };
                conflicts.push(
                    record
                        .with_member(member.clone())
                        .with_conflicting_task(other.id.clone()),
                );
            }

            if let Some(day) = self.overloaded_day(member, period, &colliding) {
                conflicts.push(
                    ConflictRecord::new(
                        task_id,
                        ConflictKind::Overload,
                        Severity::Medium,
                        format!(
                            "{} carries more than {} concurrent tasks on {}",
                            member, self.overload_threshold, day
                        ),
                    )
                    .with_member(member.clone()),
                );
            }
        }

        debug!(
            member_count = candidate.assigned_members.len(),
            conflicts = conflicts.len(),
            "conflict rules evaluated"
        );
        conflicts
    }

    /// First day of the period where the member's other regular tasks exceed
    /// the allowance
    fn overloaded_day(
        &self,
        member: &str,
        period: &WorkPeriod,
        colliding: &[&Task],
    ) -> Option<NaiveDate> {
        for day in period.days() {
            let concurrent = colliding
                .iter()
                .filter(|other| {
                    other.task_type == TaskType::Task
                        && other.assigned_members.iter().any(|m| m == member)
                        && other.work_period.as_ref().is_some_and(|p| {
                            p.start_date.date_naive() <= day && day <= p.end_date.date_naive()
                        })
                })
                .count();
            if concurrent > self.overload_threshold {
                return Some(day);
            }
        }
        None
    }

    /// Persist the detection snapshot for a committed operation
    ///
    /// A non-empty set replaces the existing one atomically. An empty set
    /// clears persisted conflicts only when the operation changed dates or
    /// members; otherwise stale records are left for the next full pass.
    pub async fn persist_detection(
        &self,
        task_id: &str,
        outcome: &DetectionOutcome,
        schedule_changed: bool,
    ) -> AppResult<()> {
        let mut records = outcome.conflicts.clone();
        for record in &mut records {
            record.entity_id = task_id.to_string();
        }
        if !records.is_empty() {
            self.store.replace_for_task(task_id, &records).await
        } else if schedule_changed {
            self.store.clear_for_task(task_id).await
        } else {
            Ok(())
        }
    }

    /// Persisted unresolved conflicts for a task
    pub async fn persisted_for_task(&self, task_id: &str) -> AppResult<Vec<ConflictRecord>> {
        self.store.list_for_task(task_id).await
    }

    /// Build a version-mismatch record for an optimistic-concurrency failure
    pub fn version_mismatch_record(
        task_id: &str,
        affected_fields: Vec<String>,
        local: Value,
        remote: Value,
    ) -> ConflictRecord {
        let mut record = ConflictRecord::new(
            task_id,
            ConflictKind::VersionMismatch,
            Severity::Critical,
            "local update raced a newer upstream revision".to_string(),
        );
        record.affected_fields = Some(affected_fields);
        record.local_data = Some(local);
        record.remote_data = Some(remote);
        record
    }
}
