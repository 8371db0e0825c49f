//! Persistence adapters
//!
//! SQL repositories over the local document store: user accounts, refresh
//! tokens, sync logs, the conflict log and the per-environment upstream
//! config. The schema is applied idempotently at startup; a connect failure
//! is fatal (exit code 1).

pub mod conflicts;
pub mod crypto;
pub mod notion_config;
pub mod sync_logs;
pub mod tokens;
pub mod users;

pub use conflicts::ConflictLogRepo;
pub use crypto::{CryptoError, TokenCipher};
pub use notion_config::{NotionConfigRepo, NotionConfigRow};
pub use sync_logs::SyncLogRepo;
pub use tokens::{RefreshTokenRepo, RefreshTokenRow};
pub use users::{UserRepo, UserRow};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::AppResult;

/// Idempotent schema, applied on every startup
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    member_id TEXT,
    failed_logins INTEGER NOT NULL DEFAULT 0,
    locked_until TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS refresh_tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    family_id TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    replaced_by TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_refresh_family ON refresh_tokens(family_id);

CREATE TABLE IF NOT EXISTS sync_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_kind TEXT NOT NULL,
    source_id TEXT NOT NULL,
    method TEXT NOT NULL,
    status TEXT NOT NULL,
    items_processed INTEGER NOT NULL,
    items_failed INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    webhook_event_id TEXT,
    errors TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS conflict_logs (
    id TEXT PRIMARY KEY,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    member_id TEXT,
    conflicting_task_id TEXT,
    detected_at TEXT NOT NULL,
    resolved_at TEXT,
    resolution TEXT NOT NULL DEFAULT 'pending',
    auto_resolved INTEGER NOT NULL DEFAULT 0,
    affected_fields TEXT,
    details TEXT NOT NULL,
    local_data TEXT,
    remote_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_conflict_entity ON conflict_logs(entity_id);

CREATE TABLE IF NOT EXISTS notion_configs (
    environment TEXT PRIMARY KEY,
    token_cipher TEXT,
    webhook_secret_cipher TEXT,
    database_map TEXT NOT NULL DEFAULT '{}',
    capture_mode INTEGER NOT NULL DEFAULT 0,
    capture_enabled_at TEXT,
    capture_payload TEXT,
    audit_log TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);
"#;

/// Connect to the document store and apply the schema
pub async fn connect(database_url: &str) -> AppResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;

    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            sqlx::query(statement).execute(&pool).await?;
        }
    }

    info!(database_url, "document store ready");
    Ok(pool)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    connect("sqlite::memory:").await.expect("in-memory store")
}
