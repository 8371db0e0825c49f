//! Property-ID mapping
//!
//! The upstream exposes entities as pages whose fields live under named
//! properties with service-assigned ids. The mapping between the internal
//! entity shape and that property schema is confined to this module: the
//! tables below are the single place property names are spelled out.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::domain::{
    EntityKind, EntityRecord, Task, TaskInput, TaskPatch, TaskStatus, TaskType, WorkPeriod,
};

use super::{UpstreamError, UpstreamResult};

/// Task property names, internal field first
pub const TASK_PROPERTIES: &[(&str, &str)] = &[
    ("title", "Title"),
    ("work_period", "Work Period"),
    ("assigned_members", "Assigned Members"),
    ("project_id", "Project"),
    ("task_type", "Type"),
    ("status", "Status"),
    ("billed_hours", "Billed Hours"),
    ("actual_hours", "Actual Hours"),
    ("add_to_calendar", "Add To Calendar"),
    ("client_planning", "Client Planning"),
    ("notes", "Notes"),
];

/// Title property name per entity kind
pub const NAME_PROPERTIES: &[(&str, &str)] = &[
    ("task", "Title"),
    ("project", "Name"),
    ("client", "Name"),
    ("member", "Name"),
    ("team", "Name"),
];

/// Upstream database ids per entity kind, from the persisted config
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMap {
    /// Tasks database
    pub tasks: String,
    /// Projects database
    pub projects: String,
    /// Clients database
    pub clients: String,
    /// Members database
    pub members: String,
    /// Teams database
    pub teams: String,
}

impl DatabaseMap {
    /// Database id for a kind
    pub fn id_for(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Task => &self.tasks,
            EntityKind::Project => &self.projects,
            EntityKind::Client => &self.clients,
            EntityKind::Member => &self.members,
            EntityKind::Team => &self.teams,
        }
    }

    /// Reverse lookup: which kind a database id belongs to
    pub fn kind_for(&self, database_id: &str) -> Option<EntityKind> {
        EntityKind::all()
            .into_iter()
            .find(|kind| self.id_for(*kind) == database_id)
    }
}

fn property_name(field: &str) -> &'static str {
    TASK_PROPERTIES
        .iter()
        .find(|(internal, _)| *internal == field)
        .map(|(_, upstream)| *upstream)
        .unwrap_or("Title")
}

// ============================================================================
// Property value readers
// ============================================================================

fn properties_of(page: &Value) -> UpstreamResult<&Map<String, Value>> {
    page.get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| UpstreamError::SchemaMismatch("page has no properties object".to_string()))
}

fn plain_text(prop: &Value) -> Option<String> {
    let fragments = prop
        .get("title")
        .or_else(|| prop.get("rich_text"))?
        .as_array()?;
    let text: String = fragments
        .iter()
        .filter_map(|f| f.get("plain_text").and_then(Value::as_str))
        .collect();
    Some(text)
}

fn date_range(prop: &Value) -> Option<WorkPeriod> {
    let date = prop.get("date")?;
    let start: DateTime<Utc> = date.get("start")?.as_str()?.parse().ok()?;
    let end: DateTime<Utc> = date
        .get("end")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(start);
    Some(WorkPeriod {
        start_date: start,
        end_date: end,
    })
}

fn relation_ids(prop: &Value) -> Vec<String> {
    prop.get("relation")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn select_name(prop: &Value) -> Option<String> {
    prop.get("select")
        .or_else(|| prop.get("status"))
        .and_then(|s| s.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn number(prop: &Value) -> f64 {
    prop.get("number").and_then(Value::as_f64).unwrap_or(0.0)
}

fn checkbox(prop: &Value) -> bool {
    prop.get("checkbox").and_then(Value::as_bool).unwrap_or(false)
}

fn timestamp(page: &Value, key: &str) -> UpstreamResult<DateTime<Utc>> {
    page.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| UpstreamError::SchemaMismatch(format!("page missing {}", key)))
}

fn task_type_from_name(name: &str) -> TaskType {
    match name {
        "holiday" => TaskType::Holiday,
        "school" => TaskType::School,
        "remote" => TaskType::Remote,
        _ => TaskType::Task,
    }
}

fn task_type_name(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Task => "task",
        TaskType::Holiday => "holiday",
        TaskType::School => "school",
        TaskType::Remote => "remote",
    }
}

fn status_from_name(name: &str) -> TaskStatus {
    match name {
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        _ => TaskStatus::NotStarted,
    }
}

fn status_name(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::NotStarted => "not_started",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
    }
}

// ============================================================================
// Page -> entity
// ============================================================================

/// Convert an upstream page into a [`Task`]
pub fn task_from_page(page: &Value) -> UpstreamResult<Task> {
    let id = page
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| UpstreamError::SchemaMismatch("page missing id".to_string()))?
        .to_string();
    let props = properties_of(page)?;

    let prop = |field: &str| props.get(property_name(field));

    let title = prop("title")
        .and_then(plain_text)
        .ok_or_else(|| UpstreamError::SchemaMismatch(format!("task {} missing title", id)))?;

    Ok(Task {
        id,
        title,
        work_period: prop("work_period").and_then(date_range),
        assigned_members: prop("assigned_members").map(relation_ids).unwrap_or_default(),
        project_id: prop("project_id")
            .map(relation_ids)
            .and_then(|ids| ids.into_iter().next()),
        task_type: prop("task_type")
            .and_then(select_name)
            .map(|name| task_type_from_name(&name))
            .unwrap_or_default(),
        status: prop("status")
            .and_then(select_name)
            .map(|name| status_from_name(&name))
            .unwrap_or_default(),
        billed_hours: prop("billed_hours").map(number).unwrap_or(0.0),
        actual_hours: prop("actual_hours").map(number).unwrap_or(0.0),
        add_to_calendar: prop("add_to_calendar").map(checkbox).unwrap_or(false),
        client_planning: prop("client_planning").map(checkbox).unwrap_or(false),
        notes: prop("notes").and_then(plain_text).filter(|s| !s.is_empty()),
        created_at: timestamp(page, "created_time")?,
        updated_at: timestamp(page, "last_edited_time")?,
    })
}

/// Convert an upstream page into a generic [`EntityRecord`]
pub fn entity_from_page(kind: EntityKind, page: &Value) -> UpstreamResult<EntityRecord> {
    let id = page
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| UpstreamError::SchemaMismatch("page missing id".to_string()))?
        .to_string();
    let props = properties_of(page)?;

    let name_property = NAME_PROPERTIES
        .iter()
        .find(|(k, _)| *k == kind.prefix())
        .map(|(_, name)| *name)
        .unwrap_or("Name");

    let name = props
        .get(name_property)
        .and_then(plain_text)
        .ok_or_else(|| UpstreamError::SchemaMismatch(format!("{} {} missing name", kind, id)))?;

    let mut relations = HashMap::new();
    for (prop_name, prop_value) in props {
        if prop_value.get("relation").is_some() {
            relations.insert(prop_name.clone(), relation_ids(prop_value));
        }
    }

    Ok(EntityRecord {
        id,
        name,
        relations,
        archived: page
            .get("archived")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        created_at: timestamp(page, "created_time").ok(),
        updated_at: timestamp(page, "last_edited_time").ok(),
    })
}

// ============================================================================
// Entity -> page properties
// ============================================================================

fn title_value(text: &str) -> Value {
    json!({ "title": [{ "type": "text", "text": { "content": text }, "plain_text": text }] })
}

fn rich_text_value(text: &str) -> Value {
    json!({ "rich_text": [{ "type": "text", "text": { "content": text }, "plain_text": text }] })
}

fn date_value(period: &WorkPeriod) -> Value {
    json!({ "date": {
        "start": period.start_date.to_rfc3339(),
        "end": period.end_date.to_rfc3339(),
    }})
}

fn relation_value(ids: &[String]) -> Value {
    let items: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
    json!({ "relation": items })
}

/// Build the property payload for creating a task
pub fn task_input_to_properties(input: &TaskInput) -> Value {
    let mut props = Map::new();
    props.insert(property_name("title").to_string(), title_value(&input.title));
    if let Some(period) = &input.work_period {
        props.insert(property_name("work_period").to_string(), date_value(period));
    }
    props.insert(
        property_name("assigned_members").to_string(),
        relation_value(&input.assigned_members),
    );
    if let Some(project) = &input.project_id {
        props.insert(
            property_name("project_id").to_string(),
            relation_value(std::slice::from_ref(project)),
        );
    }
    props.insert(
        property_name("task_type").to_string(),
        json!({ "select": { "name": task_type_name(input.task_type) } }),
    );
    props.insert(
        property_name("status").to_string(),
        json!({ "status": { "name": status_name(input.status) } }),
    );
    props.insert(
        property_name("billed_hours").to_string(),
        json!({ "number": input.billed_hours }),
    );
    props.insert(
        property_name("actual_hours").to_string(),
        json!({ "number": input.actual_hours }),
    );
    props.insert(
        property_name("add_to_calendar").to_string(),
        json!({ "checkbox": input.add_to_calendar }),
    );
    props.insert(
        property_name("client_planning").to_string(),
        json!({ "checkbox": input.client_planning }),
    );
    if let Some(notes) = &input.notes {
        props.insert(property_name("notes").to_string(), rich_text_value(notes));
    }
    Value::Object(props)
}

/// Build the property payload for a partial task update
pub fn task_patch_to_properties(patch: &TaskPatch) -> Value {
    let mut props = Map::new();
    if let Some(title) = &patch.title {
        props.insert(property_name("title").to_string(), title_value(title));
    }
    if let Some(period) = &patch.work_period {
        let value = match period {
            Some(p) => date_value(p),
            None => json!({ "date": null }),
        };
        props.insert(property_name("work_period").to_string(), value);
    }
    if let Some(members) = &patch.assigned_members {
        props.insert(
            property_name("assigned_members").to_string(),
            relation_value(members),
        );
    }
    if let Some(project) = &patch.project_id {
        let ids = project.clone().map(|p| vec![p]).unwrap_or_default();
        props.insert(property_name("project_id").to_string(), relation_value(&ids));
    }
    if let Some(task_type) = patch.task_type {
        props.insert(
            property_name("task_type").to_string(),
            json!({ "select": { "name": task_type_name(task_type) } }),
        );
    }
    if let Some(status) = patch.status {
        props.insert(
            property_name("status").to_string(),
            json!({ "status": { "name": status_name(status) } }),
        );
    }
    if let Some(hours) = patch.billed_hours {
        props.insert(property_name("billed_hours").to_string(), json!({ "number": hours }));
    }
    if let Some(hours) = patch.actual_hours {
        props.insert(property_name("actual_hours").to_string(), json!({ "number": hours }));
    }
    if let Some(flag) = patch.add_to_calendar {
        props.insert(
            property_name("add_to_calendar").to_string(),
            json!({ "checkbox": flag }),
        );
    }
    if let Some(flag) = patch.client_planning {
        props.insert(
            property_name("client_planning").to_string(),
            json!({ "checkbox": flag }),
        );
    }
    if let Some(notes) = &patch.notes {
        let value = match notes {
            Some(text) => rich_text_value(text),
            None => json!({ "rich_text": [] }),
        };
        props.insert(property_name("notes").to_string(), value);
    }
    Value::Object(props)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_page() -> Value {
        json!({
            "id": "page-1",
            "created_time": "2025-08-01T00:00:00Z",
            "last_edited_time": "2025-08-02T00:00:00Z",
            "archived": false,
            "properties": {
                "Title": { "title": [{ "plain_text": "Launch prep" }] },
                "Work Period": { "date": { "start": "2025-09-01T09:00:00Z", "end": "2025-09-01T11:00:00Z" } },
                "Assigned Members": { "relation": [{ "id": "m1" }, { "id": "m2" }] },
                "Project": { "relation": [{ "id": "p1" }] },
                "Type": { "select": { "name": "task" } },
                "Status": { "status": { "name": "in_progress" } },
                "Billed Hours": { "number": 8.0 },
                "Actual Hours": { "number": 3.5 },
                "Add To Calendar": { "checkbox": true },
                "Client Planning": { "checkbox": false },
                "Notes": { "rich_text": [{ "plain_text": "check scope" }] }
            }
        })
    }

    #[test]
    fn test_task_from_page() {
        let task = task_from_page(&sample_page()).unwrap();
        assert_eq!(task.id, "page-1");
        assert_eq!(task.title, "Launch prep");
        assert_eq!(task.assigned_members, vec!["m1", "m2"]);
        assert_eq!(task.project_id.as_deref(), Some("p1"));
        assert_eq!(task.task_type, TaskType::Task);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.billed_hours, 8.0);
        assert!(task.add_to_calendar);
        assert_eq!(task.notes.as_deref(), Some("check scope"));
        assert!(task.work_period.is_some());
    }

    #[test]
    fn test_task_from_page_without_title_is_schema_mismatch() {
        let page = json!({
            "id": "page-2",
            "created_time": "2025-08-01T00:00:00Z",
            "last_edited_time": "2025-08-01T00:00:00Z",
            "properties": {}
        });
        assert!(matches!(
            task_from_page(&page),
            Err(UpstreamError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_input_roundtrips_through_page_shape() {
        let input = TaskInput {
            title: "A".into(),
            work_period: Some(WorkPeriod {
                start_date: "2025-01-10T00:00:00Z".parse().unwrap(),
                end_date: "2025-01-11T00:00:00Z".parse().unwrap(),
            }),
            assigned_members: vec!["m1".into()],
            project_id: None,
            task_type: TaskType::Task,
            status: TaskStatus::NotStarted,
            billed_hours: 0.0,
            actual_hours: 0.0,
            add_to_calendar: false,
            client_planning: false,
            notes: None,
        };
        let props = task_input_to_properties(&input);
        let page = json!({
            "id": "real-1",
            "created_time": "2025-01-09T00:00:00Z",
            "last_edited_time": "2025-01-09T00:00:00Z",
            "properties": props,
        });
        let task = task_from_page(&page).unwrap();
        assert_eq!(task.title, "A");
        assert_eq!(task.assigned_members, vec!["m1"]);
        assert_eq!(task.work_period.unwrap().days().len(), 2);
    }

    #[test]
    fn test_patch_only_emits_set_fields() {
        let patch = TaskPatch {
            title: Some("Renamed".into()),
            ..TaskPatch::default()
        };
        let props = task_patch_to_properties(&patch);
        let obj = props.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("Title"));
    }

    #[test]
    fn test_entity_from_page_collects_relations() {
        let page = json!({
            "id": "proj-1",
            "created_time": "2025-08-01T00:00:00Z",
            "last_edited_time": "2025-08-01T00:00:00Z",
            "properties": {
                "Name": { "title": [{ "plain_text": "Website" }] },
                "Client": { "relation": [{ "id": "c1" }] },
                "Tasks": { "relation": [{ "id": "t1" }, { "id": "t2" }] }
            }
        });
        let entity = entity_from_page(EntityKind::Project, &page).unwrap();
        assert_eq!(entity.name, "Website");
        assert_eq!(entity.relation("Client"), &["c1".to_string()]);
        assert_eq!(entity.relation("Tasks").len(), 2);
    }

    #[test]
    fn test_database_map_reverse_lookup() {
        let map = DatabaseMap {
            tasks: "db-t".into(),
            projects: "db-p".into(),
            clients: "db-c".into(),
            members: "db-m".into(),
            teams: "db-e".into(),
        };
        assert_eq!(map.kind_for("db-t"), Some(EntityKind::Task));
        assert_eq!(map.kind_for("db-m"), Some(EntityKind::Member));
        assert_eq!(map.kind_for("nope"), None);
    }
}
