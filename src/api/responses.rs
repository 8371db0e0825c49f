//! API response envelopes

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domain::{ConflictRecord, DetectionMethod, SyncStatus};

/// Standard success envelope
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Payload
    pub data: T,
    /// Request metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Plain success
    pub fn new(data: T) -> Self {
        Self {
            data,
            meta: None,
            timestamp: Utc::now(),
        }
    }

    /// Success with metadata
    pub fn with_meta(data: T, meta: ResponseMeta) -> Self {
        Self {
            data,
            meta: Some(meta),
            timestamp: Utc::now(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// Request metadata
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    /// Whether the write ran async or sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    /// Conflict-detection sourcing method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<DetectionMethod>,
}

/// Task payload on read and write responses
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// The (possibly optimistic) task record
    pub data: Value,
    /// Write-pipeline status for this entity
    pub sync_status: SyncStatus,
    /// Known conflicts for this entity
    pub conflicts: Vec<ConflictRecord>,
    /// Request metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Assemble an envelope
    pub fn new(data: Value, sync_status: SyncStatus, conflicts: Vec<ConflictRecord>) -> Self {
        Self {
            data,
            sync_status,
            conflicts,
            meta: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach metadata
    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

impl IntoResponse for TaskEnvelope {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// One item of a 207 batch response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    /// Target entity id
    pub id: String,
    /// Whether this item was accepted
    pub success: bool,
    /// Failure message, when not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
