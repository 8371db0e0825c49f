//! HTTP surface
//!
//! - `routes`: router assembly under `/api/v1`
//! - `handlers`: task CRUD, calendar reads, conflict previews, batch
//! - `auth`: login / refresh / logout
//! - `webhooks`: the signed ingest endpoint
//! - `monitoring`: health, metrics snapshots, operator actions
//! - `middleware`: request ids, bearer auth, boundary rate limits
//! - `responses`: response envelopes

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod monitoring;
pub mod responses;
pub mod routes;
pub mod webhooks;

pub use routes::router;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::auth::JwtManager;
use crate::cache::{CacheManager, CacheStore};
use crate::config::Config;
use crate::conflict::ConflictEngine;
use crate::db::{ConflictLogRepo, NotionConfigRepo, RefreshTokenRepo, SyncLogRepo, UserRepo};
use crate::jobs::JobRunner;
use crate::metrics::MetricsRegistry;
use crate::sync::SyncQueue;
use crate::upstream::client::UpstreamApi;
use crate::upstream::{DiscoveryService, RateLimiter};
use crate::webhook::WebhookService;

/// Shared application state injected into every handler
///
/// Every service is constructed once at startup and injected; unit tests
/// swap individual fields for in-memory fakes.
#[derive(Clone)]
pub struct AppState {
    /// Startup configuration
    pub config: Arc<Config>,
    /// Document-store pool (health checks)
    pub pool: SqlitePool,
    /// The cache store
    pub cache: Arc<CacheStore>,
    /// Get-or-fetch orchestration
    pub manager: Arc<CacheManager>,
    /// The write queue
    pub queue: Arc<SyncQueue>,
    /// The upstream client
    pub upstream: Arc<dyn UpstreamApi>,
    /// The upstream call scheduler
    pub limiter: Arc<RateLimiter>,
    /// Conflict detection
    pub engine: Arc<ConflictEngine>,
    /// Upstream schema discovery
    pub discovery: Arc<DiscoveryService>,
    /// Metrics registry
    pub metrics: Arc<MetricsRegistry>,
    /// User accounts
    pub users: Arc<UserRepo>,
    /// Refresh tokens
    pub tokens: Arc<RefreshTokenRepo>,
    /// Sync log
    pub sync_logs: Arc<SyncLogRepo>,
    /// Conflict log
    pub conflicts: Arc<ConflictLogRepo>,
    /// Per-environment upstream configuration
    pub notion_config: Arc<NotionConfigRepo>,
    /// Webhook ingest service
    pub webhook: Arc<WebhookService>,
    /// Cron job runner
    pub jobs: Arc<JobRunner>,
    /// Access token minting and verification
    pub jwt: Arc<JwtManager>,
    /// Whether an upstream token is installed
    pub upstream_configured: bool,
}
