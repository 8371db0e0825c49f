//! Traffic Sync backend entry point
//!
//! Startup order: configuration, logging, document store, cache backend,
//! upstream client, services, HTTP server. A failed database or cache
//! connection is fatal and exits with code 1.

use std::process;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use traffic_sync::api::{self, AppState};
use traffic_sync::auth::JwtManager;
use traffic_sync::cache::{CacheManager, CacheStore};
use traffic_sync::config::Config;
use traffic_sync::conflict::{ConflictEngine, ConflictStore};
use traffic_sync::db::{
    self, ConflictLogRepo, NotionConfigRepo, RefreshTokenRepo, SyncLogRepo, TokenCipher, UserRepo,
};
use traffic_sync::jobs::JobRunner;
use traffic_sync::metrics::MetricsRegistry;
use traffic_sync::sync::{spawn_reconciler, SyncEvents, SyncQueue, SyncWorker};
use traffic_sync::upstream::client::{NotionClient, UpstreamApi};
use traffic_sync::upstream::{DiscoveryService, RateLimiter};
use traffic_sync::webhook::WebhookService;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "fatal startup error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);

    info!("═══════════════════════════════════════════════");
    info!("  Traffic Sync backend");
    info!("  Version: {}", traffic_sync::VERSION);
    info!("  Environment: {}", config.environment.as_str());
    info!("═══════════════════════════════════════════════");

    // Document store; a connect failure is fatal.
    let pool = db::connect(&config.database_url).await?;

    // Cache backend: Redis when configured, in-process otherwise.
    let cache = Arc::new(match &config.cache_url {
        Some(url) => {
            info!(url, "using Redis cache backend");
            CacheStore::redis(url).await?
        }
        None => {
            info!("using in-process cache backend");
            CacheStore::memory()
        }
    });

    let metrics = Arc::new(MetricsRegistry::new());
    let manager = Arc::new(CacheManager::new(Arc::clone(&cache), Arc::clone(&metrics)));

    // Repositories.
    let cipher = TokenCipher::new(&config.encryption_key);
    let users = Arc::new(UserRepo::new(pool.clone()));
    let tokens = Arc::new(RefreshTokenRepo::new(pool.clone()));
    let sync_logs = Arc::new(SyncLogRepo::new(pool.clone()));
    let conflicts = Arc::new(ConflictLogRepo::new(pool.clone()));
    let notion_config = Arc::new(NotionConfigRepo::new(
        pool.clone(),
        cipher,
        config.environment.as_str(),
    ));

    // Upstream client: env token wins, the persisted per-environment config
    // is the fallback.
    let limiter = Arc::new(RateLimiter::with_defaults());
    let client = Arc::new(NotionClient::new(
        config.upstream_base_url.clone(),
        config.upstream_token.clone(),
        Arc::clone(&limiter),
    )?);
    let mut upstream_configured = config.upstream_token.is_some();
    if !upstream_configured {
        if let Some(token) = notion_config.token().await? {
            client.set_token(token);
            upstream_configured = true;
        }
    }
    client.set_database_map(notion_config.load().await?.parsed_database_map());
    let upstream: Arc<dyn UpstreamApi> = client;

    // Write pipeline.
    let events = Arc::new(SyncEvents::new());
    let queue = Arc::new(SyncQueue::new(
        Arc::clone(&cache),
        Arc::clone(&events),
        Arc::clone(&metrics),
    ));
    let worker = SyncWorker::new(
        Arc::clone(&queue),
        Arc::clone(&upstream),
        Arc::clone(&cache),
        Arc::clone(&metrics),
    )
    .spawn();
    spawn_reconciler(&events, Arc::clone(&conflicts) as Arc<dyn ConflictStore>);

    // Conflict engine and schema discovery.
    let engine = Arc::new(ConflictEngine::new(
        Arc::clone(&cache),
        Arc::clone(&upstream),
        Arc::clone(&conflicts) as Arc<dyn ConflictStore>,
    ));
    let discovery = Arc::new(DiscoveryService::new(Arc::clone(&upstream)));

    // Webhook ingest and cron jobs.
    let webhook = Arc::new(WebhookService::new(
        Arc::clone(&notion_config),
        Arc::clone(&cache),
        Arc::clone(&sync_logs),
    ));
    let jobs = Arc::new(JobRunner::new(
        Arc::clone(&manager),
        Arc::clone(&cache),
        Arc::clone(&upstream),
        Arc::clone(&sync_logs),
        Arc::clone(&metrics),
    ));
    jobs.spawn();

    let jwt = Arc::new(JwtManager::new(&config.jwt_secret));

    let state = AppState {
        config: Arc::clone(&config),
        pool,
        cache,
        manager,
        queue: Arc::clone(&queue),
        upstream,
        limiter,
        engine,
        discovery,
        metrics,
        users,
        tokens,
        sync_logs,
        conflicts,
        notion_config,
        webhook,
        jobs,
        jwt,
        upstream_configured,
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(queue, worker))
        .await?;
    Ok(())
}

/// On SIGINT, stop the queue worker after its current item, then let the
/// server drain
async fn shutdown_signal(
    queue: Arc<SyncQueue>,
    worker: tokio::task::JoinHandle<()>,
) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    queue.stop();
    let _ = worker.await;
}
