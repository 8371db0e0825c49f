//! Sync-log rows
//!
//! Every synchronization pass (webhook-triggered, scheduled or manual)
//! appends one row describing what was processed and how it went.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What triggered the sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    /// A signed upstream notification
    Webhook,
    /// A cron schedule
    Scheduled,
    /// An operator action
    Manual,
}

impl SyncMethod {
    /// Wire name, as persisted
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Webhook => "webhook",
            SyncMethod::Scheduled => "scheduled",
            SyncMethod::Manual => "manual",
        }
    }
}

/// Outcome of a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    /// Everything processed
    Success,
    /// At least one item failed
    Failed,
}

impl SyncOutcome {
    /// Wire name, as persisted
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Success => "success",
            SyncOutcome::Failed => "failed",
        }
    }
}

/// One synchronization pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    /// Kind of the affected entities
    pub entity_kind: String,

    /// Upstream id that triggered the pass (page or database id)
    pub source_id: String,

    /// Trigger
    pub method: SyncMethod,

    /// Outcome
    pub status: SyncOutcome,

    /// Items handled
    pub items_processed: u32,

    /// Items that failed
    pub items_failed: u32,

    /// Pass start
    pub start_time: DateTime<Utc>,

    /// Pass end
    pub end_time: DateTime<Utc>,

    /// Duration in milliseconds
    pub duration_ms: i64,

    /// Upstream event id for webhook-triggered passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_event_id: Option<String>,

    /// Collected error messages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SyncLog {
    /// Build a log row for a completed pass
    pub fn finished(
        entity_kind: impl Into<String>,
        source_id: impl Into<String>,
        method: SyncMethod,
        start_time: DateTime<Utc>,
        items_processed: u32,
        errors: Vec<String>,
    ) -> Self {
        let end_time = Utc::now();
        let items_failed = errors.len() as u32;
        Self {
            entity_kind: entity_kind.into(),
            source_id: source_id.into(),
            method,
            status: if items_failed == 0 {
                SyncOutcome::Success
            } else {
                SyncOutcome::Failed
            },
            items_processed,
            items_failed,
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
            webhook_event_id: None,
            errors,
        }
    }

    /// Attach the upstream event id
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.webhook_event_id = Some(event_id.into());
        self
    }
}
