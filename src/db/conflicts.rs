//! Conflict log repository
//!
//! Persists detection snapshots. The set for a task is replaced wholesale
//! (delete-by-filter then insert, one transaction); concurrent detection
//! passes on the same task race and the later writer wins.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::conflict::ConflictStore;
use crate::domain::{ConflictKind, ConflictRecord, Resolution, Severity};
use crate::error::{AppError, AppResult};

/// Resolved records are kept at least this long
pub const RESOLVED_RETENTION_DAYS: i64 = 90;

/// Conflict log repository
pub struct ConflictLogRepo {
    pool: SqlitePool,
}

fn enum_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn enum_parse<T: serde::de::DeserializeOwned>(raw: &str) -> AppResult<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| AppError::Internal(format!("bad enum value {}: {}", raw, e)))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> AppResult<ConflictRecord> {
    let kind: String = row.get("kind");
    let severity: String = row.get("severity");
    let resolution: String = row.get("resolution");
    let affected: Option<String> = row.get("affected_fields");
    let local: Option<String> = row.get("local_data");
    let remote: Option<String> = row.get("remote_data");

    Ok(ConflictRecord {
        id: row.get("id"),
        entity_kind: row.get("entity_kind"),
        entity_id: row.get("entity_id"),
        kind: enum_parse::<ConflictKind>(&kind)?,
        severity: enum_parse::<Severity>(&severity)?,
        member_id: row.get("member_id"),
        conflicting_task_id: row.get("conflicting_task_id"),
        detected_at: row.get("detected_at"),
        resolved_at: row.get("resolved_at"),
        resolution: enum_parse::<Resolution>(&resolution)?,
        auto_resolved: row.get("auto_resolved"),
        affected_fields: affected.and_then(|raw| serde_json::from_str(&raw).ok()),
        details: row.get("details"),
        local_data: local.and_then(|raw| serde_json::from_str(&raw).ok()),
        remote_data: remote.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

impl ConflictLogRepo {
    /// Wrap a pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_with<'e, E>(executor: E, record: &ConflictRecord) -> AppResult<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            "INSERT INTO conflict_logs \
             (id, entity_kind, entity_id, kind, severity, member_id, conflicting_task_id, \
              detected_at, resolved_at, resolution, auto_resolved, affected_fields, details, \
              local_data, remote_data) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.entity_kind)
        .bind(&record.entity_id)
        .bind(enum_str(&record.kind))
        .bind(enum_str(&record.severity))
        .bind(&record.member_id)
        .bind(&record.conflicting_task_id)
        .bind(record.detected_at)
        .bind(record.resolved_at)
        .bind(enum_str(&record.resolution))
        .bind(record.auto_resolved)
        .bind(
            record
                .affected_fields
                .as_ref()
                .map(|f| serde_json::to_string(f).unwrap_or_default()),
        )
        .bind(&record.details)
        .bind(
            record
                .local_data
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default()),
        )
        .bind(
            record
                .remote_data
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default()),
        )
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Insert a single record (version mismatches)
    pub async fn insert(&self, record: &ConflictRecord) -> AppResult<()> {
        Self::insert_with(&self.pool, record).await
    }

    /// Mark a record resolved
    pub async fn resolve(
        &self,
        id: &str,
        resolution: Resolution,
        auto_resolved: bool,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE conflict_logs SET resolution = ?, resolved_at = ?, auto_resolved = ? \
             WHERE id = ?",
        )
        .bind(enum_str(&resolution))
        .bind(Utc::now())
        .bind(auto_resolved)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unresolved records across all tasks, newest first
    pub async fn list_unresolved(&self, limit: i64) -> AppResult<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM conflict_logs WHERE resolution = 'pending' \
             ORDER BY detected_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Drop resolved records past the retention window
    pub async fn purge_resolved(&self) -> AppResult<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - Duration::days(RESOLVED_RETENTION_DAYS);
        let result = sqlx::query(
            "DELETE FROM conflict_logs WHERE resolved_at IS NOT NULL AND resolved_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ConflictStore for ConflictLogRepo {
    async fn replace_for_task(&self, task_id: &str, records: &[ConflictRecord]) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM conflict_logs WHERE entity_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        for record in records {
            Self::insert_with(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_for_task(&self, task_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM conflict_logs WHERE entity_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_for_task(&self, task_id: &str) -> AppResult<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM conflict_logs WHERE entity_id = ? ORDER BY detected_at DESC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn reassign_task(&self, old_id: &str, new_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE conflict_logs SET entity_id = ? WHERE entity_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE conflict_logs SET conflicting_task_id = ? WHERE conflicting_task_id = ?",
        )
        .bind(new_id)
        .bind(old_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn record(task_id: &str, kind: ConflictKind) -> ConflictRecord {
        ConflictRecord::new(task_id, kind, Severity::High, "details".into())
            .with_member("m1")
            .with_conflicting_task("other")
    }

    #[tokio::test]
    async fn test_replace_is_full_snapshot() {
        let repo = ConflictLogRepo::new(test_pool().await);

        repo.replace_for_task(
            "t1",
            &[
                record("t1", ConflictKind::Overlap),
                record("t1", ConflictKind::Holiday),
            ],
        )
        .await
        .unwrap();
        assert_eq!(repo.list_for_task("t1").await.unwrap().len(), 2);

        // The next pass replaces, never overlays.
        repo.replace_for_task("t1", &[record("t1", ConflictKind::Overload)])
            .await
            .unwrap();
        let rows = repo.list_for_task("t1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, ConflictKind::Overload);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_fields() {
        let repo = ConflictLogRepo::new(test_pool().await);
        let mut original = record("t2", ConflictKind::VersionMismatch);
        original.affected_fields = Some(vec!["title".into()]);
        original.local_data = Some(serde_json::json!({"title": "mine"}));
        original.remote_data = Some(serde_json::json!({"title": "theirs"}));

        repo.insert(&original).await.unwrap();
        let rows = repo.list_for_task("t2").await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.kind, ConflictKind::VersionMismatch);
        assert_eq!(row.severity, Severity::High);
        assert_eq!(row.member_id.as_deref(), Some("m1"));
        assert_eq!(row.affected_fields.as_deref(), Some(&["title".to_string()][..]));
        assert_eq!(row.local_data, original.local_data);
    }

    #[tokio::test]
    async fn test_clear_and_reassign() {
        let repo = ConflictLogRepo::new(test_pool().await);
        repo.replace_for_task("temp_x", &[record("temp_x", ConflictKind::Overlap)])
            .await
            .unwrap();

        repo.reassign_task("temp_x", "real_y").await.unwrap();
        assert!(repo.list_for_task("temp_x").await.unwrap().is_empty());
        assert_eq!(repo.list_for_task("real_y").await.unwrap().len(), 1);

        repo.clear_for_task("real_y").await.unwrap();
        assert!(repo.list_for_task("real_y").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_and_unresolved_listing() {
        let repo = ConflictLogRepo::new(test_pool().await);
        let row = record("t3", ConflictKind::Overlap);
        repo.insert(&row).await.unwrap();

        assert_eq!(repo.list_unresolved(10).await.unwrap().len(), 1);
        assert!(repo
            .resolve(&row.id, Resolution::LocalWins, false)
            .await
            .unwrap());
        assert!(repo.list_unresolved(10).await.unwrap().is_empty());

        // Freshly resolved records survive the retention purge.
        assert_eq!(repo.purge_resolved().await.unwrap(), 0);
    }
}
