//! Refresh tokens
//!
//! Seven-day refresh tokens with family rotation: each refresh issues a new
//! token in the same family and retires the old one. Presenting an
//! already-rotated token is treated as replay and revokes the whole family.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Refresh token lifetime, days
pub const REFRESH_TTL_DAYS: i64 = 7;

/// One refresh token row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRow {
    /// Opaque token value
    pub token: String,
    /// Owning user
    pub user_id: String,
    /// Rotation family
    pub family_id: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Revoked flag
    pub revoked: bool,
    /// Token that superseded this one
    pub replaced_by: Option<String>,
    /// Issue time
    pub created_at: DateTime<Utc>,
}

/// Refresh token repository
pub struct RefreshTokenRepo {
    pool: SqlitePool,
}

impl RefreshTokenRepo {
    /// Wrap a pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Issue a fresh token, starting a new family
    pub async fn issue(&self, user_id: &str) -> AppResult<RefreshTokenRow> {
        self.insert(user_id, &Uuid::new_v4().to_string()).await
    }

    async fn insert(&self, user_id: &str, family_id: &str) -> AppResult<RefreshTokenRow> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO refresh_tokens (token, user_id, family_id, expires_at, revoked, created_at) \
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&token)
        .bind(user_id)
        .bind(family_id)
        .bind(now + Duration::days(REFRESH_TTL_DAYS))
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find(&token)
            .await?
            .ok_or_else(|| AppError::Internal("token vanished after insert".to_string()))
    }

    /// Look a token up
    pub async fn find(&self, token: &str) -> AppResult<Option<RefreshTokenRow>> {
        Ok(sqlx::query_as::<_, RefreshTokenRow>(
            "SELECT * FROM refresh_tokens WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Rotate a presented token: retire it and issue its successor in the
    /// same family. Replay of a retired token revokes the family.
    pub async fn rotate(&self, token: &str) -> AppResult<RefreshTokenRow> {
        let current = self
            .find(token)
            .await?
            .ok_or_else(|| AppError::Unauthorized("unknown refresh token".to_string()))?;

        if current.revoked || current.replaced_by.is_some() {
            // Replay: someone is holding a stale copy of this family.
            self.revoke_family(&current.family_id).await?;
            return Err(AppError::Unauthorized(
                "refresh token reuse detected".to_string(),
            ));
        }
        if current.expires_at <= Utc::now() {
            return Err(AppError::Unauthorized("refresh token expired".to_string()));
        }

        let next = self.insert(&current.user_id, &current.family_id).await?;
        sqlx::query("UPDATE refresh_tokens SET replaced_by = ? WHERE token = ?")
            .bind(&next.token)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(next)
    }

    /// Revoke every token in a family
    pub async fn revoke_family(&self, family_id: &str) -> AppResult<u64> {
        let result = sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE family_id = ?")
            .bind(family_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Drop expired rows
    pub async fn purge_expired(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
