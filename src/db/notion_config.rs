//! Per-environment upstream configuration
//!
//! A single row per environment holding the encrypted integration token, the
//! encrypted webhook secret, the database-id map, the webhook capture-mode
//! block and an audit log of configuration changes.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::upstream::mapping::DatabaseMap;

use super::crypto::TokenCipher;

/// Capture mode disarms itself after this long
pub const CAPTURE_WINDOW_MINUTES: i64 = 5;

/// The decoded configuration row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotionConfigRow {
    /// Environment name
    pub environment: String,
    /// Encrypted integration token
    pub token_cipher: Option<String>,
    /// Encrypted webhook secret
    pub webhook_secret_cipher: Option<String>,
    /// JSON database-id map
    pub database_map: String,
    /// Whether capture mode is armed
    pub capture_mode: bool,
    /// When capture mode was armed
    pub capture_enabled_at: Option<DateTime<Utc>>,
    /// The captured request, once one arrived
    pub capture_payload: Option<String>,
    /// JSON audit log
    pub audit_log: String,
    /// Row update time
    pub updated_at: DateTime<Utc>,
}

impl NotionConfigRow {
    /// Parse the database-id map
    pub fn parsed_database_map(&self) -> DatabaseMap {
        serde_json::from_str(&self.database_map).unwrap_or_default()
    }

    /// Whether capture mode is armed and still inside its window
    pub fn capture_active(&self) -> bool {
        self.capture_mode
            && self.capture_enabled_at.is_some_and(|at| {
                Utc::now() - at < Duration::minutes(CAPTURE_WINDOW_MINUTES)
            })
    }
}

/// Upstream config repository
pub struct NotionConfigRepo {
    pool: SqlitePool,
    cipher: TokenCipher,
    environment: String,
}

impl NotionConfigRepo {
    /// Wrap a pool for one environment
    pub fn new(pool: SqlitePool, cipher: TokenCipher, environment: impl Into<String>) -> Self {
        Self {
            pool,
            cipher,
            environment: environment.into(),
        }
    }

    async fn ensure_row(&self) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO notion_configs (environment, updated_at) VALUES (?, ?) \
             ON CONFLICT(environment) DO NOTHING",
        )
        .bind(&self.environment)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load the environment's row, creating an empty one on first use
    pub async fn load(&self) -> AppResult<NotionConfigRow> {
        self.ensure_row().await?;
        Ok(sqlx::query_as::<_, NotionConfigRow>(
            "SELECT * FROM notion_configs WHERE environment = ?",
        )
        .bind(&self.environment)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn audit(&self, action: &str) -> AppResult<()> {
        let row = self.load().await?;
        let mut log: Vec<Value> = serde_json::from_str(&row.audit_log).unwrap_or_default();
        log.push(json!({ "action": action, "at": Utc::now() }));
        sqlx::query("UPDATE notion_configs SET audit_log = ?, updated_at = ? WHERE environment = ?")
            .bind(serde_json::to_string(&log)?)
            .bind(Utc::now())
            .bind(&self.environment)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store the integration token, encrypted
    pub async fn set_token(&self, token: &str) -> AppResult<()> {
        self.ensure_row().await?;
        sqlx::query(
            "UPDATE notion_configs SET token_cipher = ?, updated_at = ? WHERE environment = ?",
        )
        .bind(self.cipher.encrypt(token))
        .bind(Utc::now())
        .bind(&self.environment)
        .execute(&self.pool)
        .await?;
        self.audit("token updated").await
    }

    /// Decrypt the stored integration token
    pub async fn token(&self) -> AppResult<Option<String>> {
        let row = self.load().await?;
        row.token_cipher
            .map(|cipher| {
                self.cipher
                    .decrypt(&cipher)
                    .map_err(|e| AppError::Internal(format!("token decryption failed: {}", e)))
            })
            .transpose()
    }

    /// Store the webhook secret, encrypted
    pub async fn set_webhook_secret(&self, secret: &str) -> AppResult<()> {
        self.ensure_row().await?;
        sqlx::query(
            "UPDATE notion_configs SET webhook_secret_cipher = ?, updated_at = ? \
             WHERE environment = ?",
        )
        .bind(self.cipher.encrypt(secret))
        .bind(Utc::now())
        .bind(&self.environment)
        .execute(&self.pool)
        .await?;
        self.audit("webhook secret updated").await
    }

    /// Decrypt the stored webhook secret
    pub async fn webhook_secret(&self) -> AppResult<Option<String>> {
        let row = self.load().await?;
        row.webhook_secret_cipher
            .map(|cipher| {
                self.cipher
                    .decrypt(&cipher)
                    .map_err(|e| AppError::Internal(format!("secret decryption failed: {}", e)))
            })
            .transpose()
    }

    /// Store the database-id map
    pub async fn set_database_map(&self, map: &DatabaseMap) -> AppResult<()> {
        self.ensure_row().await?;
        sqlx::query(
            "UPDATE notion_configs SET database_map = ?, updated_at = ? WHERE environment = ?",
        )
        .bind(serde_json::to_string(map)?)
        .bind(Utc::now())
        .bind(&self.environment)
        .execute(&self.pool)
        .await?;
        self.audit("database map updated").await
    }

    /// Arm or disarm webhook capture mode
    pub async fn set_capture_mode(&self, enabled: bool) -> AppResult<()> {
        self.ensure_row().await?;
        let enabled_at = enabled.then(Utc::now);
        sqlx::query(
            "UPDATE notion_configs SET capture_mode = ?, capture_enabled_at = ?, updated_at = ? \
             WHERE environment = ?",
        )
        .bind(enabled)
        .bind(enabled_at)
        .bind(Utc::now())
        .bind(&self.environment)
        .execute(&self.pool)
        .await?;
        self.audit(if enabled {
            "capture mode armed"
        } else {
            "capture mode disarmed"
        })
        .await
    }

    /// Record a captured webhook request and disarm capture mode; when a
    /// secret was inferred it is stored encrypted
    pub async fn store_capture(
        &self,
        payload: &Value,
        inferred_secret: Option<&str>,
    ) -> AppResult<()> {
        self.ensure_row().await?;
        sqlx::query(
            "UPDATE notion_configs SET capture_payload = ?, capture_mode = 0, updated_at = ? \
             WHERE environment = ?",
        )
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now())
        .bind(&self.environment)
        .execute(&self.pool)
        .await?;

        if let Some(secret) = inferred_secret {
            self.set_webhook_secret(secret).await?;
            info!("webhook secret captured and stored");
        }
        self.audit("webhook request captured").await
    }
}
