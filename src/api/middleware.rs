//! HTTP middleware
//!
//! Request ids, bearer-token authentication, role checks, activity tracking
//! and the per-IP boundary rate limits (the upstream-facing limiter is a
//! different component; this one protects the HTTP surface itself).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use crate::auth::TokenClaims;
use crate::error::AppError;

use super::AppState;

/// Request id header
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// General API allowance: 100 requests per 15 minutes per IP
pub fn general_rate_limit() -> Arc<HttpRateLimit> {
    Arc::new(HttpRateLimit::new(100, Duration::from_secs(15 * 60)))
}

/// Auth endpoints allowance: 5 requests per 15 minutes per IP
pub fn auth_rate_limit() -> Arc<HttpRateLimit> {
    Arc::new(HttpRateLimit::new(5, Duration::from_secs(15 * 60)))
}

/// Fixed-window per-IP counter
pub struct HttpRateLimit {
    limit: u32,
    window: Duration,
    counters: DashMap<String, (Instant, u32)>,
}

impl HttpRateLimit {
    /// Build a limiter
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            counters: DashMap::new(),
        }
    }

    /// Count a request; `false` when over the allowance
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(client.to_string())
            .or_insert((now, 0));
        let (window_start, count) = *entry;
        if now.duration_since(window_start) > self.window {
            *entry = (now, 1);
            return true;
        }
        if count >= self.limit {
            return false;
        }
        *entry = (window_start, count + 1);
        true
    }
}

fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Attach (or propagate) a request id
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// The propagated request id
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Per-IP fixed-window rate limiting
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<HttpRateLimit>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip(&request);
    if !limiter.check(&client) {
        return AppError::RateLimited("too many requests".to_string()).into_response();
    }
    next.run(request).await
}

/// Bearer-token authentication; inserts [`TokenClaims`] for handlers
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let claims = match token {
        Some(token) => match state.jwt.verify(token) {
            Ok(claims) => claims,
            Err(err) => return err.into_response(),
        },
        None => {
            return AppError::Unauthorized("missing bearer token".to_string()).into_response()
        }
    };

    state.metrics.activity.record_user(&claims.sub);
    request.extensions_mut().insert(claims);
    next.run(request).await
}

/// Reject non-admin bearers; run after `auth_middleware`
pub async fn require_admin_middleware(request: Request, next: Next) -> Response {
    match request.extensions().get::<TokenClaims>() {
        Some(claims) if claims.is_admin() => next.run(request).await,
        Some(_) => AppError::Forbidden("admin role required".to_string()).into_response(),
        None => AppError::Unauthorized("missing bearer token".to_string()).into_response(),
    }
}

/// Count every request toward the rolling rate
pub async fn activity_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    state.metrics.activity.record_request();
    next.run(request).await
}

/// CORS for the configured front-end origins
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
