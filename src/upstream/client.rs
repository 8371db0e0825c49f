//! Typed upstream client
//!
//! CRUD over the five entity kinds. Every operation:
//!
//! - wraps each HTTP attempt in the retry policy (`retry`),
//! - schedules each attempt through the rate limiter at the caller's
//!   priority,
//! - maps the external property schema to the internal entity shape
//!   (`mapping`),
//! - paginates transparently until the upstream reports `has_more=false`.
//!
//! Deletes are soft: `archive_task` flips the upstream `archived` flag,
//! there is no hard delete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{EntityKind, EntityRecord, Task, TaskInput, TaskPatch, TaskStatus};

use super::limiter::RateLimiter;
use super::mapping::{self, DatabaseMap};
use super::retry::retry;
use super::{UpstreamError, UpstreamResult};

/// Default per-call deadline
const CALL_DEADLINE: Duration = Duration::from_secs(15);

/// Page size requested from the upstream
const PAGE_SIZE: u32 = 100;

/// Range query over tasks
#[derive(Debug, Clone, Default)]
pub struct TaskRangeQuery {
    /// Window start; tasks whose work period overlaps the window match
    pub start: Option<DateTime<Utc>>,
    /// Window end
    pub end: Option<DateTime<Utc>>,
    /// Restrict to these statuses, empty means any
    pub statuses: Vec<TaskStatus>,
    /// Restrict to tasks assigned to any of these members, empty means any
    pub members: Vec<String>,
}

/// Filters for listing a kind
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Restrict by archived state
    pub archived: Option<bool>,
}

/// Operations the rest of the system needs from the upstream
///
/// The production implementation is [`NotionClient`]; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Create a task and return the confirmed entity
    async fn create_task(&self, input: &TaskInput, priority: u8) -> UpstreamResult<Task>;

    /// Fetch a single task
    async fn get_task(&self, id: &str, priority: u8) -> UpstreamResult<Task>;

    /// Apply a partial update and return the refreshed entity
    async fn update_task(&self, id: &str, patch: &TaskPatch, priority: u8) -> UpstreamResult<Task>;

    /// Soft-delete a task
    async fn archive_task(&self, id: &str, priority: u8) -> UpstreamResult<()>;

    /// Query tasks by work-period overlap, status and assignment
    async fn query_tasks(&self, query: &TaskRangeQuery, priority: u8) -> UpstreamResult<Vec<Task>>;

    /// List every entity of a kind matching the filter
    async fn list_entities(
        &self,
        kind: EntityKind,
        filter: &ListFilter,
        priority: u8,
    ) -> UpstreamResult<Vec<EntityRecord>>;

    /// Create a non-task entity from a pre-mapped property payload
    async fn create_entity(
        &self,
        kind: EntityKind,
        properties: Value,
        priority: u8,
    ) -> UpstreamResult<EntityRecord>;

    /// Update a non-task entity from a pre-mapped property payload
    async fn update_entity(
        &self,
        kind: EntityKind,
        id: &str,
        properties: Value,
        priority: u8,
    ) -> UpstreamResult<EntityRecord>;

    /// Soft-delete any entity
    async fn archive_entity(&self, kind: EntityKind, id: &str, priority: u8)
        -> UpstreamResult<()>;

    /// Raw database schema, for discovery
    async fn database_schema(&self, kind: EntityKind, priority: u8) -> UpstreamResult<Value>;
}

/// HTTP client against the upstream document service
pub struct NotionClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    database_map: RwLock<DatabaseMap>,
    limiter: Arc<RateLimiter>,
}

impl NotionClient {
    /// Build a client; the token and database map may arrive later from the
    /// persisted per-environment config
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        limiter: Arc<RateLimiter>,
    ) -> UpstreamResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_DEADLINE)
            .build()
            .map_err(UpstreamError::from)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: RwLock::new(token),
            database_map: RwLock::new(DatabaseMap::default()),
            limiter,
        })
    }

    /// Install the integration token (from env or persisted config)
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Install the database-id map from the persisted config
    pub fn set_database_map(&self, map: DatabaseMap) {
        *self.database_map.write() = map;
    }

    /// Current database-id map
    pub fn database_map(&self) -> DatabaseMap {
        self.database_map.read().clone()
    }

    fn database_id(&self, kind: EntityKind) -> UpstreamResult<String> {
        let id = self.database_map.read().id_for(kind).to_string();
        if id.is_empty() {
            return Err(UpstreamError::SchemaMismatch(format!(
                "no database configured for kind {}",
                kind
            )));
        }
        Ok(id)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> UpstreamResult<Value> {
        let token = self
            .token
            .read()
            .clone()
            .ok_or_else(|| UpstreamError::Unauthorized("no integration token".to_string()))?;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(token)
            .header("Notion-Version", "2022-06-28");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| status.to_string());

        Err(match status {
            StatusCode::NOT_FOUND => UpstreamError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => UpstreamError::RateLimited(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                UpstreamError::Unauthorized(message)
            }
            StatusCode::BAD_REQUEST => UpstreamError::SchemaMismatch(message),
            s if s.is_server_error() => UpstreamError::Upstream5xx {
                status: s.as_u16(),
                message,
            },
            s => UpstreamError::Network(format!("unexpected status {}: {}", s, message)),
        })
    }

    /// One limited, retried call. The retry wrapper is outermost so each
    /// attempt is individually paced by the limiter.
    async fn call(
        &self,
        priority: u8,
        context: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> UpstreamResult<Value> {
        retry(context, || {
            let method = method.clone();
            let body = body.as_ref();
            async move {
                self.limiter
                    .schedule(priority, self.send(method, path, body))
                    .await
                    .map_err(UpstreamError::from)
            }
        })
        .await
    }

    /// Run a database query, following cursors until exhausted
    async fn query_database(
        &self,
        database_id: &str,
        filter: Option<Value>,
        priority: u8,
    ) -> UpstreamResult<Vec<Value>> {
        let path = format!("/databases/{}/query", database_id);
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut body = json!({ "page_size": PAGE_SIZE });
            if let Some(filter) = &filter {
                body["filter"] = filter.clone();
            }
            if let Some(cursor) = &cursor {
                body["start_cursor"] = json!(cursor);
            }

            let response = self
                .call(priority, "query_database", reqwest::Method::POST, &path, Some(body))
                .await?;

            if let Some(results) = response.get("results").and_then(Value::as_array) {
                pages.extend(results.iter().cloned());
            }

            let has_more = response
                .get("has_more")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !has_more {
                break;
            }
            cursor = response
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        debug!(database_id, pages = pages.len(), "database query complete");
        Ok(pages)
    }

    fn range_filter(query: &TaskRangeQuery) -> Option<Value> {
        let mut clauses = Vec::new();

        if let Some(end) = query.end {
            clauses.push(json!({
                "property": "Work Period",
                "date": { "on_or_before": end.to_rfc3339() }
            }));
        }
        if let Some(start) = query.start {
            clauses.push(json!({
                "property": "Work Period",
                "date": { "on_or_after": start.to_rfc3339() }
            }));
        }
        if !query.members.is_empty() {
            let members: Vec<Value> = query
                .members
                .iter()
                .map(|m| json!({ "property": "Assigned Members", "relation": { "contains": m } }))
                .collect();
            clauses.push(json!({ "or": members }));
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<Value> = query
                .statuses
                .iter()
                .map(|s| {
                    let name = serde_json::to_value(s)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default();
                    json!({ "property": "Status", "status": { "equals": name } })
                })
                .collect();
            clauses.push(json!({ "or": statuses }));
        }

        if clauses.is_empty() {
            None
        } else {
            Some(json!({ "and": clauses }))
        }
    }
}

#[async_trait]
impl UpstreamApi for NotionClient {
    async fn create_task(&self, input: &TaskInput, priority: u8) -> UpstreamResult<Task> {
        let database_id = self.database_id(EntityKind::Task)?;
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": mapping::task_input_to_properties(input),
        });
        let page = self
            .call(priority, "create_task", reqwest::Method::POST, "/pages", Some(body))
            .await?;
        mapping::task_from_page(&page)
    }

    async fn get_task(&self, id: &str, priority: u8) -> UpstreamResult<Task> {
        let path = format!("/pages/{}", id);
        let page = self
            .call(priority, "get_task", reqwest::Method::GET, &path, None)
            .await?;
        mapping::task_from_page(&page)
    }

    async fn update_task(&self, id: &str, patch: &TaskPatch, priority: u8) -> UpstreamResult<Task> {
        let path = format!("/pages/{}", id);
        let body = json!({ "properties": mapping::task_patch_to_properties(patch) });
        let page = self
            .call(priority, "update_task", reqwest::Method::PATCH, &path, Some(body))
            .await?;
        mapping::task_from_page(&page)
    }

    async fn archive_task(&self, id: &str, priority: u8) -> UpstreamResult<()> {
        self.archive_entity(EntityKind::Task, id, priority).await
    }

    async fn query_tasks(&self, query: &TaskRangeQuery, priority: u8) -> UpstreamResult<Vec<Task>> {
        let database_id = self.database_id(EntityKind::Task)?;
        let pages = self
            .query_database(&database_id, Self::range_filter(query), priority)
            .await?;
        pages.iter().map(mapping::task_from_page).collect()
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        filter: &ListFilter,
        priority: u8,
    ) -> UpstreamResult<Vec<EntityRecord>> {
        let database_id = self.database_id(kind)?;
        let pages = self.query_database(&database_id, None, priority).await?;
        let entities: Vec<EntityRecord> = pages
            .iter()
            .map(|page| mapping::entity_from_page(kind, page))
            .collect::<UpstreamResult<_>>()?;
        Ok(match filter.archived {
            Some(archived) => entities
                .into_iter()
                .filter(|e| e.archived == archived)
                .collect(),
            None => entities,
        })
    }

    async fn create_entity(
        &self,
        kind: EntityKind,
        properties: Value,
        priority: u8,
    ) -> UpstreamResult<EntityRecord> {
        let database_id = self.database_id(kind)?;
        let body = json!({
            "parent": { "database_id": database_id },
            "properties": properties,
        });
        let page = self
            .call(priority, "create_entity", reqwest::Method::POST, "/pages", Some(body))
            .await?;
        mapping::entity_from_page(kind, &page)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: &str,
        properties: Value,
        priority: u8,
    ) -> UpstreamResult<EntityRecord> {
        let path = format!("/pages/{}", id);
        let body = json!({ "properties": properties });
        let page = self
            .call(priority, "update_entity", reqwest::Method::PATCH, &path, Some(body))
            .await?;
        mapping::entity_from_page(kind, &page)
    }

    async fn archive_entity(
        &self,
        _kind: EntityKind,
        id: &str,
        priority: u8,
    ) -> UpstreamResult<()> {
        let path = format!("/pages/{}", id);
        let body = json!({ "archived": true });
        self.call(priority, "archive_entity", reqwest::Method::PATCH, &path, Some(body))
            .await?;
        Ok(())
    }

    async fn database_schema(&self, kind: EntityKind, priority: u8) -> UpstreamResult<Value> {
        let database_id = self.database_id(kind)?;
        let path = format!("/databases/{}", database_id);
        self.call(priority, "database_schema", reqwest::Method::GET, &path, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::limiter::RateLimiter;

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let limiter = Arc::new(RateLimiter::with_defaults());
        let client = NotionClient::new("http://localhost:1", None, limiter).unwrap();
        client.set_database_map(DatabaseMap {
            tasks: "db-t".into(),
            ..DatabaseMap::default()
        });
        let err = client.get_task("t1", 5).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_database_is_schema_mismatch() {
        let limiter = Arc::new(RateLimiter::with_defaults());
        let client =
            NotionClient::new("http://localhost:1", Some("secret".into()), limiter).unwrap();
        let err = client
            .query_tasks(&TaskRangeQuery::default(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::SchemaMismatch(_)));
    }

    #[test]
    fn test_range_filter_shape() {
        let query = TaskRangeQuery {
            start: Some("2025-09-01T00:00:00Z".parse().unwrap()),
            end: Some("2025-09-30T00:00:00Z".parse().unwrap()),
            statuses: vec![TaskStatus::InProgress],
            members: vec!["m1".into()],
        };
        let filter = NotionClient::range_filter(&query).unwrap();
        let clauses = filter["and"].as_array().unwrap();
        assert_eq!(clauses.len(), 4);
    }

    #[test]
    fn test_empty_query_has_no_filter() {
        assert!(NotionClient::range_filter(&TaskRangeQuery::default()).is_none());
    }
}
