//! Shared test doubles

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};

use traffic_sync::domain::{
    EntityKind, EntityRecord, Task, TaskInput, TaskPatch, TaskStatus, TaskType,
};
use traffic_sync::upstream::client::{ListFilter, TaskRangeQuery, UpstreamApi};
use traffic_sync::upstream::{UpstreamError, UpstreamResult};

/// In-memory upstream with scriptable failures
pub struct FakeUpstream {
    pub tasks: Mutex<HashMap<String, Task>>,
    pub create_calls: AtomicU32,
    next_id: AtomicU32,
    fail_with: Mutex<Option<fn() -> UpstreamError>>,
}

impl FakeUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            create_calls: AtomicU32::new(0),
            next_id: AtomicU32::new(1),
            fail_with: Mutex::new(None),
        })
    }

    pub fn always_fail(&self, factory: fn() -> UpstreamError) {
        *self.fail_with.lock() = Some(factory);
    }

    pub fn heal(&self) {
        *self.fail_with.lock() = None;
    }

    fn check(&self) -> UpstreamResult<()> {
        match *self.fail_with.lock() {
            Some(factory) => Err(factory()),
            None => Ok(()),
        }
    }

    pub fn seed_task(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }
}

/// A minimal valid task
pub fn blank_task(id: &str, title: &str) -> Task {
    Task {
        id: id.to_string(),
        title: title.to_string(),
        work_period: None,
        assigned_members: Vec::new(),
        project_id: None,
        task_type: TaskType::Task,
        status: TaskStatus::NotStarted,
        billed_hours: 0.0,
        actual_hours: 0.0,
        add_to_calendar: false,
        client_planning: false,
        notes: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn create_task(&self, input: &TaskInput, _priority: u8) -> UpstreamResult<Task> {
        self.check()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("real-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut task = blank_task(&id, &input.title);
        task.work_period = input.work_period.clone();
        task.assigned_members = input.assigned_members.clone();
        task.task_type = input.task_type;
        self.tasks.lock().insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &str, _priority: u8) -> UpstreamResult<Task> {
        self.check()?;
        self.tasks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(id.to_string()))
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch, _priority: u8) -> UpstreamResult<Task> {
        self.check()?;
        let mut tasks = self.tasks.lock();
        let current = tasks
            .get(id)
            .cloned()
            .unwrap_or_else(|| blank_task(id, ""));
        let mut updated = patch.apply_to(&current);
        updated.updated_at = Utc::now();
        tasks.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn archive_task(&self, id: &str, priority: u8) -> UpstreamResult<()> {
        self.archive_entity(EntityKind::Task, id, priority).await
    }

    async fn query_tasks(&self, _query: &TaskRangeQuery, _priority: u8) -> UpstreamResult<Vec<Task>> {
        self.check()?;
        Ok(self.tasks.lock().values().cloned().collect())
    }

    async fn list_entities(
        &self,
        _kind: EntityKind,
        _filter: &ListFilter,
        _priority: u8,
    ) -> UpstreamResult<Vec<EntityRecord>> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn create_entity(
        &self,
        _kind: EntityKind,
        _properties: Value,
        _priority: u8,
    ) -> UpstreamResult<EntityRecord> {
        Err(UpstreamError::SchemaMismatch("not exercised".into()))
    }

    async fn update_entity(
        &self,
        _kind: EntityKind,
        _id: &str,
        _properties: Value,
        _priority: u8,
    ) -> UpstreamResult<EntityRecord> {
        Err(UpstreamError::SchemaMismatch("not exercised".into()))
    }

    async fn archive_entity(
        &self,
        _kind: EntityKind,
        id: &str,
        _priority: u8,
    ) -> UpstreamResult<()> {
        self.check()?;
        self.tasks.lock().remove(id);
        Ok(())
    }

    async fn database_schema(&self, _kind: EntityKind, _priority: u8) -> UpstreamResult<Value> {
        Ok(json!({}))
    }
}
