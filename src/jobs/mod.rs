//! Scheduled maintenance jobs
//!
//! Two schedules drive cache freshness:
//!
//! - **refresh**, every 30 minutes: re-fetch the hot working set that is
//!   about to expire (current-week tasks, members, teams)
//! - **warmup**, daily at 06:00: full warmup through the cache manager
//!
//! Ticks never overlap themselves; a tick that fires while the previous run
//! is still going is skipped. Both jobs run their upstream loads at low
//! priority and are exposed for manual triggering by operators.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, Utc};
use cron::Schedule;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::keys::{calendar_range_key, entity_key, latency_bucket_key, list_key};
use crate::cache::{CacheKind, CacheManager, CacheStore, WarmupReport};
use crate::domain::{EntityKind, SyncLog, SyncMethod};
use crate::db::sync_logs::SyncLogRepo;
use crate::metrics::MetricsRegistry;
use crate::upstream::client::{ListFilter, TaskRangeQuery, UpstreamApi};
use crate::upstream::limiter::PRIORITY_LOW;

/// Refresh cadence (second-resolution cron)
pub const REFRESH_SCHEDULE: &str = "0 */30 * * * *";

/// Daily warmup at 06:00
pub const WARMUP_SCHEDULE: &str = "0 0 6 * * *";

/// Outcome of a refresh pass
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    /// Current-week tasks re-cached
    pub tasks: usize,
    /// Members re-cached
    pub members: usize,
    /// Teams re-cached
    pub teams: usize,
    /// Section failures
    pub errors: Vec<String>,
}

/// Periodic cache maintenance runner
pub struct JobRunner {
    manager: Arc<CacheManager>,
    cache: Arc<CacheStore>,
    upstream: Arc<dyn UpstreamApi>,
    sync_logs: Arc<SyncLogRepo>,
    metrics: Arc<MetricsRegistry>,
    refresh_running: AtomicBool,
    warmup_running: AtomicBool,
}

impl JobRunner {
    /// Wire the runner
    pub fn new(
        manager: Arc<CacheManager>,
        cache: Arc<CacheStore>,
        upstream: Arc<dyn UpstreamApi>,
        sync_logs: Arc<SyncLogRepo>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            manager,
            cache,
            upstream,
            sync_logs,
            metrics,
            refresh_running: AtomicBool::new(false),
            warmup_running: AtomicBool::new(false),
        }
    }

    /// Spawn both schedule loops
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_schedule(REFRESH_SCHEDULE, JobKind::Refresh),
            self.spawn_schedule(WARMUP_SCHEDULE, JobKind::Warmup),
        ]
    }

    fn spawn_schedule(self: &Arc<Self>, expression: &'static str, kind: JobKind) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let schedule = match Schedule::from_str(expression) {
                Ok(schedule) => schedule,
                Err(err) => {
                    error!(expression, error = %err, "invalid cron expression");
                    return;
                }
            };
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                match kind {
                    JobKind::Refresh => {
                        let _ = runner.run_refresh().await;
                    }
                    JobKind::Warmup => {
                        let _ = runner.run_warmup().await;
                    }
                }
            }
        })
    }

    /// Re-fetch the working set likely to expire soon; also the manual
    /// trigger behind the admin endpoint
    pub async fn run_refresh(&self) -> Option<RefreshReport> {
        if self.refresh_running.swap(true, Ordering::SeqCst) {
            warn!("refresh tick skipped, previous run still going");
            return None;
        }
        let started = Utc::now();
        let mut report = RefreshReport::default();

        let today = Utc::now().date_naive();
        let week_start = today - ChronoDuration::days(today.weekday().num_days_from_monday() as i64);
        let week_end = week_start + ChronoDuration::days(6);
        let query = TaskRangeQuery {
            start: week_start.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            end: week_end.and_hms_opt(23, 59, 59).map(|dt| dt.and_utc()),
            ..TaskRangeQuery::default()
        };

        match self.upstream.query_tasks(&query, PRIORITY_LOW).await {
            Ok(tasks) => {
                report.tasks = tasks.len();
                if let Ok(value) = serde_json::to_value(&tasks) {
                    let _ = self
                        .cache
                        .set(
                            &calendar_range_key(week_start, week_end),
                            value,
                            CacheKind::CalendarRange,
                        )
                        .await;
                }
                for task in &tasks {
                    if let Ok(value) = serde_json::to_value(task) {
                        let _ = self
                            .cache
                            .set(
                                &entity_key(EntityKind::Task, &task.id),
                                value,
                                CacheKind::Entity(EntityKind::Task),
                            )
                            .await;
                    }
                }
            }
            Err(err) => report.errors.push(format!("week tasks: {}", err)),
        }

        for kind in [EntityKind::Member, EntityKind::Team] {
            match self
                .upstream
                .list_entities(kind, &ListFilter::default(), PRIORITY_LOW)
                .await
            {
                Ok(entities) => {
                    match kind {
                        EntityKind::Member => report.members = entities.len(),
                        _ => report.teams = entities.len(),
                    }
                    if let Ok(value) = serde_json::to_value(&entities) {
                        let _ = self
                            .cache
                            .set(&list_key(kind), value, CacheKind::Entity(kind))
                            .await;
                    }
                    for entity in &entities {
                        if let Ok(value) = serde_json::to_value(entity) {
                            let _ = self
                                .cache
                                .set(&entity_key(kind, &entity.id), value, CacheKind::Entity(kind))
                                .await;
                        }
                    }
                }
                Err(err) => report.errors.push(format!("{}: {}", kind, err)),
            }
        }

        // Persist the hourly latency snapshot alongside the refresh.
        let bucket = latency_bucket_key(Utc::now());
        let snapshot = json!({
            "cache": self.metrics.cache_latency.snapshot(),
            "upstream": self.metrics.upstream_latency.snapshot(),
        });
        let _ = self.cache.set(&bucket, snapshot, CacheKind::Derived).await;

        let processed = (report.tasks + report.members + report.teams) as u32;
        let log = SyncLog::finished(
            "task",
            "refresh",
            SyncMethod::Scheduled,
            started,
            processed,
            report.errors.clone(),
        );
        if let Err(err) = self.sync_logs.append(&log).await {
            warn!(error = %err, "refresh sync-log append failed");
        }

        info!(
            tasks = report.tasks,
            members = report.members,
            teams = report.teams,
            errors = report.errors.len(),
            duration_ms = (Utc::now() - started).num_milliseconds(),
            "cache refresh finished"
        );
        self.refresh_running.store(false, Ordering::SeqCst);
        Some(report)
    }

    /// Full warmup through the cache manager; also the manual trigger
    pub async fn run_warmup(&self) -> Option<WarmupReport> {
        if self.warmup_running.swap(true, Ordering::SeqCst) {
            warn!("warmup tick skipped, previous run still going");
            return None;
        }
        let started = Utc::now();

        let report = self.manager.warmup(self.upstream.as_ref()).await;

        let processed = report.tasks + report.entities.values().sum::<usize>();
        let log = SyncLog::finished(
            "task",
            "warmup",
            SyncMethod::Scheduled,
            started,
            processed as u32,
            report.errors.clone(),
        );
        if let Err(err) = self.sync_logs.append(&log).await {
            warn!(error = %err, "warmup sync-log append failed");
        }

        self.warmup_running.store(false, Ordering::SeqCst);
        Some(report)
    }

    /// Summary for the health endpoint
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "refreshRunning": self.refresh_running.load(Ordering::SeqCst),
            "warmupRunning": self.warmup_running.load(Ordering::SeqCst),
            "schedules": { "refresh": REFRESH_SCHEDULE, "warmup": WARMUP_SCHEDULE },
        })
    }
}

#[derive(Clone, Copy)]
enum JobKind {
    Refresh,
    Warmup,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::upstream::{UpstreamError, UpstreamResult};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;

    struct CountingUpstream {
        calls: AtomicU32,
    }

    #[async_trait]
    impl UpstreamApi for CountingUpstream {
        async fn create_task(
            &self,
            _: &crate::domain::TaskInput,
            _: u8,
        ) -> UpstreamResult<crate::domain::Task> {
            Err(UpstreamError::SchemaMismatch("unused".into()))
        }
        async fn get_task(&self, id: &str, _: u8) -> UpstreamResult<crate::domain::Task> {
            Err(UpstreamError::NotFound(id.into()))
        }
        async fn update_task(
            &self,
            _: &str,
            _: &crate::domain::TaskPatch,
            _: u8,
        ) -> UpstreamResult<crate::domain::Task> {
            Err(UpstreamError::SchemaMismatch("unused".into()))
        }
        async fn archive_task(&self, _: &str, _: u8) -> UpstreamResult<()> {
            Ok(())
        }
        async fn query_tasks(
            &self,
            _: &TaskRangeQuery,
            _: u8,
        ) -> UpstreamResult<Vec<crate::domain::Task>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn list_entities(
            &self,
            _: EntityKind,
            _: &ListFilter,
            _: u8,
        ) -> UpstreamResult<Vec<crate::domain::EntityRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn create_entity(
            &self,
            _: EntityKind,
            _: Value,
            _: u8,
        ) -> UpstreamResult<crate::domain::EntityRecord> {
            Err(UpstreamError::SchemaMismatch("unused".into()))
        }
        async fn update_entity(
            &self,
            _: EntityKind,
            _: &str,
            _: Value,
            _: u8,
        ) -> UpstreamResult<crate::domain::EntityRecord> {
            Err(UpstreamError::SchemaMismatch("unused".into()))
        }
        async fn archive_entity(&self, _: EntityKind, _: &str, _: u8) -> UpstreamResult<()> {
            Ok(())
        }
        async fn database_schema(&self, _: EntityKind, _: u8) -> UpstreamResult<Value> {
            Ok(json!({}))
        }
    }

    async fn runner() -> Arc<JobRunner> {
        let cache = Arc::new(CacheStore::memory());
        let metrics = Arc::new(MetricsRegistry::new());
        let manager = Arc::new(CacheManager::new(Arc::clone(&cache), Arc::clone(&metrics)));
        Arc::new(JobRunner::new(
            manager,
            cache,
            Arc::new(CountingUpstream {
                calls: AtomicU32::new(0),
            }),
            Arc::new(SyncLogRepo::new(test_pool().await)),
            metrics,
        ))
    }

    #[test]
    fn test_schedules_parse() {
        assert!(Schedule::from_str(REFRESH_SCHEDULE).is_ok());
        assert!(Schedule::from_str(WARMUP_SCHEDULE).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_appends_sync_log() {
        let runner = runner().await;
        let report = runner.run_refresh().await.unwrap();
        assert!(report.errors.is_empty());

        let logs = runner.sync_logs.recent(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].method, "scheduled");
        assert_eq!(logs[0].source_id, "refresh");
    }

    #[tokio::test]
    async fn test_warmup_appends_sync_log() {
        let runner = runner().await;
        runner.run_warmup().await.unwrap();
        let logs = runner.sync_logs.recent(10).await.unwrap();
        assert_eq!(logs[0].source_id, "warmup");
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let runner = runner().await;
        runner.refresh_running.store(true, Ordering::SeqCst);
        assert!(runner.run_refresh().await.is_none());
        runner.refresh_running.store(false, Ordering::SeqCst);
        assert!(runner.run_refresh().await.is_some());
    }
}
