//! Monitoring, metrics and operator endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::metrics::MetricsKind;

use super::AppState;

/// GET /monitoring/health: aggregate health: 200 healthy, 206 degraded,
/// 503 unhealthy
pub async fn health(State(state): State<AppState>) -> Response {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let cache_ok = state.cache.stats().await.is_ok();
    let queue_len = state.queue.len();
    let queue_ok = queue_len < crate::sync::DEFAULT_MAX_SIZE;
    let upstream_configured = state.upstream_configured;

    let body = json!({
        "database": if db_ok { "up" } else { "down" },
        "cache": if cache_ok { "up" } else { "down" },
        "queue": { "length": queue_len, "healthy": queue_ok },
        "upstream": if upstream_configured { "configured" } else { "unconfigured" },
        "jobs": state.jobs.snapshot(),
        "limiter": state.limiter.stats(),
    });

    if !db_ok || !cache_ok {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unhealthy", "checks": body })))
            .into_response()
    } else if !queue_ok || !upstream_configured {
        (StatusCode::PARTIAL_CONTENT, Json(json!({ "status": "degraded", "checks": body })))
            .into_response()
    } else {
        (StatusCode::OK, Json(json!({ "status": "healthy", "checks": body }))).into_response()
    }
}

/// GET /monitoring/queue: pending queue snapshot
pub async fn queue_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "length": state.queue.len(),
        "pending": state.queue.status(),
        "metrics": state.metrics.queue.snapshot(),
    }))
}

/// GET /metrics/cache
pub async fn cache_metrics(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let stats = state
        .cache
        .stats()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "counters": state.metrics.cache.snapshot(),
        "store": stats,
    })))
}

/// GET /metrics/latency
pub async fn latency_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "cache": state.metrics.cache_latency.snapshot(),
        "upstream": state.metrics.upstream_latency.snapshot(),
    }))
}

/// GET /metrics/queue
pub async fn queue_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "queue": state.metrics.queue.snapshot(),
        "length": state.queue.len(),
        "limiter": state.limiter.stats(),
    }))
}

/// GET /metrics/dashboard: everything the dashboard needs in one call
pub async fn dashboard(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let store = state
        .cache
        .stats()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "cache": { "counters": state.metrics.cache.snapshot(), "store": store },
        "latency": {
            "cache": state.metrics.cache_latency.snapshot(),
            "upstream": state.metrics.upstream_latency.snapshot(),
        },
        "queue": {
            "metrics": state.metrics.queue.snapshot(),
            "length": state.queue.len(),
        },
        "limiter": state.limiter.stats(),
        "activity": state.metrics.activity.snapshot(),
    })))
}

// ============================================================================
// Operator endpoints
// ============================================================================

/// Pattern payload for targeted invalidation
#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    /// Glob pattern, e.g. `task:*`
    pub pattern: String,
}

/// POST /admin/cache/clear
pub async fn admin_cache_clear(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    state
        .cache
        .clear()
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    info!("cache cleared by operator");
    Ok(Json(json!({ "cleared": true })))
}

/// POST /admin/cache/warmup
pub async fn admin_cache_warmup(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.jobs.run_warmup().await {
        Some(report) => Json(json!({ "started": true, "report": report })),
        None => Json(json!({ "started": false, "reason": "warmup already running" })),
    }
}

/// POST /admin/cache/refresh
pub async fn admin_cache_refresh(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.jobs.run_refresh().await {
        Some(report) => Json(json!({ "started": true, "report": report })),
        None => Json(json!({ "started": false, "reason": "refresh already running" })),
    }
}

/// POST /admin/cache/invalidate
pub async fn admin_cache_invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let deleted = state
        .cache
        .invalidate_pattern(&request.pattern)
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;
    info!(pattern = %request.pattern, deleted, "operator invalidation");
    Ok(Json(json!({ "pattern": request.pattern, "deleted": deleted })))
}

/// POST /admin/sync/queue/clear
pub async fn admin_queue_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let dropped = state.queue.clear_queue();
    Json(json!({ "dropped": dropped }))
}

/// POST /admin/metrics/reset/:kind: kind in cache|latency|queue|all
pub async fn admin_metrics_reset(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let kind: MetricsKind = kind.parse().map_err(AppError::Validation)?;
    state.metrics.reset(kind);
    Ok(Json(json!({ "reset": true })))
}

/// GET /admin/upstream/schema/:kind: declared property schema of a kind's
/// database
pub async fn admin_upstream_schema(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let kind: crate::domain::EntityKind = kind.parse().map_err(AppError::Validation)?;
    let schema = state.discovery.describe(kind).await.map_err(AppError::from)?;
    Ok(Json(json!({ "schema": schema })))
}

/// GET /admin/upstream/relations/:kind: relation validation with orphan
/// counts per relation property
pub async fn admin_upstream_relations(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let kind: crate::domain::EntityKind = kind.parse().map_err(AppError::Validation)?;
    let map = state.notion_config.load().await?.parsed_database_map();
    let reports = state
        .discovery
        .validate_relations(kind, &map)
        .await
        .map_err(AppError::from)?;
    Ok(Json(json!({ "relations": reports })))
}

/// GET /admin/sync/logs: recent sync passes
pub async fn admin_sync_logs(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let rows = state.sync_logs.recent(50).await?;
    let rows: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "entityKind": row.entity_kind,
                "sourceId": row.source_id,
                "method": row.method,
                "status": row.status,
                "itemsProcessed": row.items_processed,
                "itemsFailed": row.items_failed,
                "durationMs": row.duration_ms,
                "webhookEventId": row.webhook_event_id,
            })
        })
        .collect();
    Ok(Json(json!({ "logs": rows })))
}
