//! Sync log repository

use sqlx::SqlitePool;

use crate::domain::{SyncLog, SyncMethod, SyncOutcome};
use crate::error::AppResult;

/// Sync log repository
pub struct SyncLogRepo {
    pool: SqlitePool,
}

/// One persisted sync-log row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncLogRow {
    /// Row id
    pub id: i64,
    /// Kind of the affected entities
    pub entity_kind: String,
    /// Triggering upstream id
    pub source_id: String,
    /// Trigger method
    pub method: String,
    /// Outcome
    pub status: String,
    /// Items handled
    pub items_processed: i64,
    /// Items failed
    pub items_failed: i64,
    /// Pass duration, milliseconds
    pub duration_ms: i64,
    /// Upstream event id, when webhook-triggered
    pub webhook_event_id: Option<String>,
    /// JSON array of error messages
    pub errors: String,
}

impl SyncLogRepo {
    /// Wrap a pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a completed pass; failures here are the caller's to swallow
    pub async fn append(&self, log: &SyncLog) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO sync_logs \
             (entity_kind, source_id, method, status, items_processed, items_failed, \
              start_time, end_time, duration_ms, webhook_event_id, errors) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.entity_kind)
        .bind(&log.source_id)
        .bind(log.method.as_str())
        .bind(log.status.as_str())
        .bind(log.items_processed as i64)
        .bind(log.items_failed as i64)
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.duration_ms)
        .bind(&log.webhook_event_id)
        .bind(serde_json::to_string(&log.errors)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent rows, newest first
    pub async fn recent(&self, limit: i64) -> AppResult<Vec<SyncLogRow>> {
        Ok(sqlx::query_as::<_, SyncLogRow>(
            "SELECT id, entity_kind, source_id, method, status, items_processed, items_failed, \
             duration_ms, webhook_event_id, errors \
             FROM sync_logs ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Rows recorded for a method, newest first
    pub async fn recent_by_method(
        &self,
        method: SyncMethod,
        limit: i64,
    ) -> AppResult<Vec<SyncLogRow>> {
        Ok(sqlx::query_as::<_, SyncLogRow>(
            "SELECT id, entity_kind, source_id, method, status, items_processed, items_failed, \
             duration_ms, webhook_event_id, errors \
             FROM sync_logs WHERE method = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(method.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Failed passes in the window, for the health endpoint
    pub async fn failed_count(&self) -> AppResult<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sync_logs WHERE status = ?")
                .bind(SyncOutcome::Failed.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Utc;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let repo = SyncLogRepo::new(test_pool().await);
        let log = SyncLog::finished("task", "db-1", SyncMethod::Webhook, Utc::now(), 3, vec![])
            .with_event_id("evt-1");
        repo.append(&log).await.unwrap();

        let rows = repo.recent(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_kind, "task");
        assert_eq!(rows[0].method, "webhook");
        assert_eq!(rows[0].status, "success");
        assert_eq!(rows[0].webhook_event_id.as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn test_filter_by_method_and_failed_count() {
        let repo = SyncLogRepo::new(test_pool().await);
        repo.append(&SyncLog::finished(
            "task",
            "db-1",
            SyncMethod::Webhook,
            Utc::now(),
            1,
            vec![],
        ))
        .await
        .unwrap();
        repo.append(&SyncLog::finished(
            "member",
            "db-2",
            SyncMethod::Scheduled,
            Utc::now(),
            0,
            vec!["boom".into()],
        ))
        .await
        .unwrap();

        let webhooks = repo.recent_by_method(SyncMethod::Webhook, 10).await.unwrap();
        assert_eq!(webhooks.len(), 1);
        assert_eq!(repo.failed_count().await.unwrap(), 1);
    }
}
