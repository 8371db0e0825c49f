//! Task endpoints
//!
//! Reads are cache-preferred. Writes run in one of two modes selected by the
//! `async` query flag: async mode enqueues the intent and answers
//! immediately with the optimistic record; sync mode writes through to the
//! upstream at high priority and answers with the confirmed state. Every
//! create and update reports scheduling conflicts.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::cache::keys::{calendar_pattern, calendar_range_key, entity_key};
use crate::cache::CacheKind;
use crate::conflict::TaskCandidate;
use crate::domain::{
    CachedTask, ConflictRecord, EntityKind, SyncFlags, SyncStatus, TaskInput, TaskPatch, TaskType,
    WorkPeriod,
};
use crate::error::{AppError, AppResult};
use crate::upstream::limiter::{PRIORITY_HIGH, PRIORITY_NORMAL};
use crate::upstream::client::TaskRangeQuery;

use super::responses::{BatchItemResult, ResponseMeta, TaskEnvelope};
use super::AppState;

fn default_true() -> bool {
    true
}

/// `?async=` write-mode selector, defaulting to async
#[derive(Debug, Deserialize)]
pub struct WriteMode {
    /// Async returns before the upstream confirms
    #[serde(rename = "async", default = "default_true")]
    pub use_async: bool,
}

impl WriteMode {
    fn label(&self) -> &'static str {
        if self.use_async {
            "async"
        } else {
            "sync"
        }
    }
}

/// Calendar range query string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarQuery {
    /// Inclusive range start, `YYYY-MM-DD`
    pub start_date: String,
    /// Inclusive range end, `YYYY-MM-DD`
    pub end_date: String,
}

fn parse_range(query: &CalendarQuery) -> AppResult<(NaiveDate, NaiveDate)> {
    let start: NaiveDate = query
        .start_date
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid startDate: {}", query.start_date)))?;
    let end: NaiveDate = query
        .end_date
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid endDate: {}", query.end_date)))?;
    if end < start {
        return Err(AppError::Validation(
            "endDate must not precede startDate".to_string(),
        ));
    }
    Ok((start, end))
}

fn validate_period(period: &Option<WorkPeriod>) -> AppResult<()> {
    if let Some(period) = period {
        if period.end_date < period.start_date {
            return Err(AppError::Validation(
                "workPeriod end must not precede start".to_string(),
            ));
        }
    }
    Ok(())
}

fn flags_of(record: &Value) -> SyncFlags {
    serde_json::from_value(record.clone()).unwrap_or_default()
}

async fn persisted_conflicts(state: &AppState, id: &str) -> Vec<ConflictRecord> {
    state.engine.persisted_for_task(id).await.unwrap_or_else(|err| {
        warn!(task_id = id, error = %err, "conflict lookup failed");
        Vec::new()
    })
}

async fn invalidate_calendar(state: &AppState) {
    if let Err(err) = state.cache.invalidate_pattern(&calendar_pattern()).await {
        // Invalidation failures never fail a data-mutating request.
        warn!(error = %err, "calendar invalidation failed");
    }
}

// ============================================================================
// Reads
// ============================================================================

/// GET /tasks/calendar: range read, cache preferred
pub async fn calendar(
    State(state): State<AppState>,
    Query(query): Query<CalendarQuery>,
) -> AppResult<Response> {
    let (start, end) = parse_range(&query)?;
    let key = calendar_range_key(start, end);

    let cache_hit = matches!(state.cache.get(&key).await, Ok(Some(_)));

    let upstream = state.upstream.clone();
    let range = TaskRangeQuery {
        start: start.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
        end: end.and_hms_opt(23, 59, 59).map(|dt| dt.and_utc()),
        ..TaskRangeQuery::default()
    };
    let tasks = state
        .manager
        .get_or_fetch(&key, CacheKind::CalendarRange, move || async move {
            let tasks = upstream.query_tasks(&range, PRIORITY_NORMAL).await?;
            Ok(serde_json::to_value(tasks)?)
        })
        .await?;

    Ok(Json(json!({
        "tasks": tasks,
        "period": { "startDate": query.start_date, "endDate": query.end_date },
        "cacheHit": cache_hit,
    }))
    .into_response())
}

/// GET /tasks/:id: single read with sync status and known conflicts
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<TaskEnvelope> {
    let key = entity_key(EntityKind::Task, &id);

    let upstream = state.upstream.clone();
    let fetch_id = id.clone();
    let record = state
        .manager
        .get_or_fetch(&key, CacheKind::Entity(EntityKind::Task), move || async move {
            let task = upstream.get_task(&fetch_id, PRIORITY_NORMAL).await?;
            Ok(serde_json::to_value(CachedTask::confirmed(task))?)
        })
        .await?;

    let flags = flags_of(&record);
    let conflicts = persisted_conflicts(&state, &id).await;
    Ok(TaskEnvelope::new(record, SyncStatus::from(&flags), conflicts))
}

// ============================================================================
// Writes
// ============================================================================

/// POST /tasks: create, optionally asynchronous
pub async fn create_task(
    State(state): State<AppState>,
    Query(mode): Query<WriteMode>,
    Json(input): Json<TaskInput>,
) -> AppResult<Response> {
    if input.title.trim().is_empty() {
        return Err(AppError::Validation("title is required".to_string()));
    }
    validate_period(&input.work_period)?;

    let outcome = state.engine.detect(&TaskCandidate::from_input(&input)).await;
    let meta = ResponseMeta {
        mode: Some(mode.label()),
        method: Some(outcome.method),
    };

    if mode.use_async {
        let payload = serde_json::to_value(&input)?;
        let temp_id = state.queue.enqueue_create(EntityKind::Task, payload).await?;

        if let Err(err) = state.engine.persist_detection(&temp_id, &outcome, true).await {
            warn!(task_id = %temp_id, error = %err, "conflict persistence failed");
        }

        let record = state
            .cache
            .get(&entity_key(EntityKind::Task, &temp_id))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| json!({ "id": temp_id }));
        let flags = flags_of(&record);

        let envelope =
            TaskEnvelope::new(record, SyncStatus::from(&flags), outcome.conflicts).with_meta(meta);
        return Ok((StatusCode::CREATED, envelope).into_response());
    }

    let task = state
        .upstream
        .create_task(&input, PRIORITY_HIGH)
        .await
        .map_err(AppError::from)?;
    let record = serde_json::to_value(CachedTask::confirmed(task.clone()))?;

    if let Err(err) = state
        .cache
        .set(
            &entity_key(EntityKind::Task, &task.id),
            record.clone(),
            CacheKind::Entity(EntityKind::Task),
        )
        .await
    {
        warn!(task_id = %task.id, error = %err, "cache fill failed after create");
    }
    invalidate_calendar(&state).await;

    if let Err(err) = state.engine.persist_detection(&task.id, &outcome, true).await {
        warn!(task_id = %task.id, error = %err, "conflict persistence failed");
    }

    let envelope =
        TaskEnvelope::new(record, SyncStatus::default(), outcome.conflicts).with_meta(meta);
    Ok((StatusCode::CREATED, envelope).into_response())
}

async fn current_task(state: &AppState, id: &str) -> AppResult<CachedTask> {
    let key = entity_key(EntityKind::Task, id);
    if let Ok(Some(record)) = state.cache.get(&key).await {
        if let Ok(cached) = serde_json::from_value::<CachedTask>(record) {
            return Ok(cached);
        }
    }
    let task = state
        .upstream
        .get_task(id, PRIORITY_HIGH)
        .await
        .map_err(AppError::from)?;
    Ok(CachedTask::confirmed(task))
}

fn patched_fields(patch: &TaskPatch) -> Vec<String> {
    let mut fields = Vec::new();
    let value = serde_json::to_value(patch).unwrap_or(Value::Null);
    if let Value::Object(map) = value {
        for (key, _) in map {
            if key != "expectedUpdatedAt" {
                fields.push(key);
            }
        }
    }
    fields
}

/// PUT /tasks/:id: partial update with optimistic concurrency
pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(mode): Query<WriteMode>,
    Json(patch): Json<TaskPatch>,
) -> AppResult<Response> {
    if let Some(period) = &patch.work_period {
        validate_period(period)?;
    }

    let current = current_task(&state, &id).await?;

    if let Some(expected) = patch.expected_updated_at {
        if expected != current.task.updated_at {
            let current_value = serde_json::to_value(&current)?;
            let record = crate::conflict::ConflictEngine::version_mismatch_record(
                &id,
                patched_fields(&patch),
                serde_json::to_value(&patch)?,
                current_value.clone(),
            );
            if let Err(err) = state.conflicts.insert(&record).await {
                warn!(task_id = %id, error = %err, "version-mismatch record insert failed");
            }
            return Err(AppError::VersionMismatch {
                entity_id: id,
                current_updated_at: current
                    .task
                    .updated_at
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                current: current_value,
            });
        }
    }

    let outcome = state
        .engine
        .detect(&TaskCandidate::from_update(&current.task, &patch))
        .await;
    let schedule_changed = patch.touches_schedule();
    let meta = ResponseMeta {
        mode: Some(mode.label()),
        method: Some(outcome.method),
    };

    if mode.use_async {
        let payload = serde_json::to_value(&patch)?;
        state
            .queue
            .enqueue_update(EntityKind::Task, &id, payload)
            .await?;
        invalidate_calendar(&state).await;

        if let Err(err) = state
            .engine
            .persist_detection(&id, &outcome, schedule_changed)
            .await
        {
            warn!(task_id = %id, error = %err, "conflict persistence failed");
        }

        let record = state
            .cache
            .get(&entity_key(EntityKind::Task, &id))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| json!({ "id": id }));
        let flags = flags_of(&record);
        let envelope =
            TaskEnvelope::new(record, SyncStatus::from(&flags), outcome.conflicts).with_meta(meta);
        return Ok(envelope.into_response());
    }

    let task = state
        .upstream
        .update_task(&id, &patch, PRIORITY_HIGH)
        .await
        .map_err(AppError::from)?;
    let record = serde_json::to_value(CachedTask::confirmed(task))?;

    if let Err(err) = state
        .cache
        .set(
            &entity_key(EntityKind::Task, &id),
            record.clone(),
            CacheKind::Entity(EntityKind::Task),
        )
        .await
    {
        warn!(task_id = %id, error = %err, "cache fill failed after update");
    }
    invalidate_calendar(&state).await;

    if let Err(err) = state
        .engine
        .persist_detection(&id, &outcome, schedule_changed)
        .await
    {
        warn!(task_id = %id, error = %err, "conflict persistence failed");
    }

    let envelope =
        TaskEnvelope::new(record, SyncStatus::default(), outcome.conflicts).with_meta(meta);
    Ok(envelope.into_response())
}

/// DELETE /tasks/:id: archive
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(mode): Query<WriteMode>,
) -> AppResult<Response> {
    if mode.use_async {
        state.queue.enqueue_delete(EntityKind::Task, &id).await?;
        invalidate_calendar(&state).await;
        return Ok(Json(json!({
            "data": { "id": id },
            "syncStatus": { "pending": true, "deleted": true },
            "meta": { "mode": "async" },
        }))
        .into_response());
    }

    state
        .upstream
        .archive_task(&id, PRIORITY_HIGH)
        .await
        .map_err(AppError::from)?;
    if let Err(err) = state.cache.del(&entity_key(EntityKind::Task, &id)).await {
        warn!(task_id = %id, error = %err, "cache delete failed after archive");
    }
    invalidate_calendar(&state).await;

    Ok(Json(json!({
        "data": { "id": id },
        "syncStatus": { "pending": false, "deleted": true },
        "meta": { "mode": "sync" },
    }))
    .into_response())
}

// ============================================================================
// Conflicts
// ============================================================================

/// Conflict preview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConflictsRequest {
    /// Original id, for update previews
    #[serde(default)]
    pub id: Option<String>,
    /// Proposed period
    #[serde(default)]
    pub work_period: Option<WorkPeriod>,
    /// Proposed members
    #[serde(default)]
    pub assigned_members: Vec<String>,
    /// Proposed type
    #[serde(default)]
    pub task_type: TaskType,
}

/// POST /tasks/check-conflicts: preview without committing anything
pub async fn check_conflicts(
    State(state): State<AppState>,
    Json(request): Json<CheckConflictsRequest>,
) -> AppResult<Response> {
    validate_period(&request.work_period)?;

    let candidate = TaskCandidate {
        id: request.id,
        work_period: request.work_period,
        assigned_members: request.assigned_members,
        task_type: request.task_type,
    };
    let outcome = state.engine.detect(&candidate).await;

    Ok(Json(json!({
        "conflicts": outcome.conflicts,
        "meta": { "method": outcome.method },
    }))
    .into_response())
}

// ============================================================================
// Batch
// ============================================================================

/// One item of a batch update
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateItem {
    /// Target task id
    pub id: String,
    /// Patch to apply
    #[serde(flatten)]
    pub patch: TaskPatch,
}

/// POST /tasks/batch: enqueue several updates, reporting per-item results
/// with 207
pub async fn batch_update(
    State(state): State<AppState>,
    Json(items): Json<Vec<BatchUpdateItem>>,
) -> AppResult<Response> {
    if items.is_empty() {
        return Err(AppError::Validation("empty batch".to_string()));
    }

    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let accepted = match serde_json::to_value(&item.patch) {
            Ok(payload) => state
                .queue
                .enqueue_update(EntityKind::Task, &item.id, payload)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        results.push(match accepted {
            Ok(()) => BatchItemResult {
                id: item.id,
                success: true,
                error: None,
            },
            Err(error) => BatchItemResult {
                id: item.id,
                success: false,
                error: Some(error),
            },
        });
    }
    invalidate_calendar(&state).await;

    Ok((StatusCode::MULTI_STATUS, Json(json!({ "results": results }))).into_response())
}
