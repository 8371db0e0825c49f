//! Scheduling conflict records
//!
//! Produced by the conflict engine and persisted in the `conflict_logs`
//! table. Records for a task are always a full snapshot of the latest
//! detection pass; partial overlays are never written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of conflict was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two tasks for the same member overlap in time
    Overlap,
    /// The member is on holiday during the period
    Holiday,
    /// The member is in training during the period
    School,
    /// The member carries too many concurrent tasks on one day
    Overload,
    /// An optimistic write raced a newer upstream revision
    VersionMismatch,
}

/// How severe a conflict is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Low,
    /// Worth looking at
    Medium,
    /// Needs attention
    High,
    /// Blocks planning
    Critical,
}

/// How a persisted conflict was (or will be) resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Not resolved yet
    #[default]
    Pending,
    /// The upstream version was kept
    NotionWins,
    /// The local version was kept
    LocalWins,
    /// Both versions were merged
    Merged,
    /// Resolved by an operator
    Manual,
}

/// A detected scheduling conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Record id
    pub id: String,

    /// Kind of the entity the conflict is attached to (always `task` today)
    pub entity_kind: String,

    /// Id of the entity the conflict is attached to
    pub entity_id: String,

    /// Conflict classification
    #[serde(rename = "type")]
    pub kind: ConflictKind,

    /// Severity
    pub severity: Severity,

    /// Member the conflict concerns, when member-scoped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,

    /// The other task involved, for overlap-shaped conflicts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicting_task_id: Option<String>,

    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,

    /// When the conflict was resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Resolution state
    #[serde(default)]
    pub resolution: Resolution,

    /// Whether the system resolved the conflict without an operator
    #[serde(default)]
    pub auto_resolved: bool,

    /// Fields affected by a version mismatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_fields: Option<Vec<String>>,

    /// Human-readable description
    pub details: String,

    /// Local-side snapshot for version mismatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_data: Option<serde_json::Value>,

    /// Remote-side snapshot for version mismatches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_data: Option<serde_json::Value>,
}

impl ConflictRecord {
    /// Build a fresh unresolved record for a task
    pub fn new(task_id: &str, kind: ConflictKind, severity: Severity, details: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_kind: "task".to_string(),
            entity_id: task_id.to_string(),
            kind,
            severity,
            member_id: None,
            conflicting_task_id: None,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: Resolution::Pending,
            auto_resolved: false,
            affected_fields: None,
            details,
            local_data: None,
            remote_data: None,
        }
    }

    /// Attach the member the conflict concerns
    pub fn with_member(mut self, member_id: impl Into<String>) -> Self {
        self.member_id = Some(member_id.into());
        self
    }

    /// Attach the other task involved
    pub fn with_conflicting_task(mut self, task_id: impl Into<String>) -> Self {
        self.conflicting_task_id = Some(task_id.into());
        self
    }
}

/// Where the conflict engine sourced its candidate set from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionMethod {
    /// The hot range cache covered the window
    #[serde(rename = "cache")]
    Cache,
    /// The cache missed; a rate-limited upstream range query was used
    #[serde(rename = "notion-hybrid")]
    NotionHybrid,
    /// The upstream was unavailable; the conflict set could not be checked
    #[serde(rename = "none")]
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_record_serialization_uses_type_key() {
        let record = ConflictRecord::new(
            "t1",
            ConflictKind::Overlap,
            Severity::High,
            "overlaps X".into(),
        )
        .with_member("m1")
        .with_conflicting_task("X");

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "overlap");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["memberId"], "m1");
        assert_eq!(value["conflictingTaskId"], "X");
    }

    #[test]
    fn test_detection_method_wire_names() {
        assert_eq!(
            serde_json::to_value(DetectionMethod::NotionHybrid).unwrap(),
            serde_json::json!("notion-hybrid")
        );
        assert_eq!(
            serde_json::to_value(DetectionMethod::None).unwrap(),
            serde_json::json!("none")
        );
    }
}
