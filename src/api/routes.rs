//! Router assembly
//!
//! Everything mounts under `/api/v1`. The webhook, health and auth routes
//! are public; all task, metrics and monitoring routes require a bearer
//! token; `/admin` additionally requires the admin role. Two per-IP rate
//! limits apply: a strict one on the auth endpoints, a general one on the
//! rest.

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::middleware::{
    activity_middleware, auth_middleware, auth_rate_limit, cors_layer, general_rate_limit,
    rate_limit_middleware, request_id_middleware, require_admin_middleware,
};
use super::{auth, handlers, monitoring, webhooks, AppState};

/// Build the application router
pub fn router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .layer(from_fn_with_state(auth_rate_limit(), rate_limit_middleware));

    let admin_routes = Router::new()
        .route("/cache/clear", post(monitoring::admin_cache_clear))
        .route("/cache/warmup", post(monitoring::admin_cache_warmup))
        .route("/cache/refresh", post(monitoring::admin_cache_refresh))
        .route("/cache/invalidate", post(monitoring::admin_cache_invalidate))
        .route("/sync/queue/clear", post(monitoring::admin_queue_clear))
        .route("/sync/logs", get(monitoring::admin_sync_logs))
        .route("/upstream/schema/:kind", get(monitoring::admin_upstream_schema))
        .route(
            "/upstream/relations/:kind",
            get(monitoring::admin_upstream_relations),
        )
        .route("/metrics/reset/:kind", post(monitoring::admin_metrics_reset))
        .layer(axum::middleware::from_fn(require_admin_middleware));

    let protected = Router::new()
        .route("/tasks/calendar", get(handlers::calendar))
        .route("/tasks/check-conflicts", post(handlers::check_conflicts))
        .route("/tasks/batch", post(handlers::batch_update))
        .route("/tasks", post(handlers::create_task))
        .route(
            "/tasks/:id",
            get(handlers::get_task)
                .put(handlers::update_task)
                .delete(handlers::delete_task),
        )
        .route("/monitoring/queue", get(monitoring::queue_status))
        .route("/metrics/cache", get(monitoring::cache_metrics))
        .route("/metrics/latency", get(monitoring::latency_metrics))
        .route("/metrics/queue", get(monitoring::queue_metrics))
        .route("/metrics/dashboard", get(monitoring::dashboard))
        .nest("/admin", admin_routes)
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let public = Router::new()
        .route("/webhooks/notion", post(webhooks::ingest))
        .route("/monitoring/health", get(monitoring::health))
        .nest("/auth", auth_routes);

    let api = public
        .merge(protected)
        .layer(from_fn_with_state(
            general_rate_limit(),
            rate_limit_middleware,
        ))
        .layer(from_fn_with_state(state.clone(), activity_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.frontend_origins))
        .with_state(state)
}
