//! Upstream schema discovery
//!
//! Retrieves a database's property schema and validates that declared
//! relations still point at live pages in their target database, reporting
//! orphan counts per relation property.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::domain::EntityKind;

use super::client::{ListFilter, UpstreamApi};
use super::limiter::PRIORITY_LOW;
use super::mapping::DatabaseMap;
use super::{UpstreamError, UpstreamResult};

/// One property of a database schema
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySpec {
    /// Service-assigned property id
    pub id: String,
    /// Property name
    pub name: String,
    /// Property type (title, date, relation, select, ...)
    pub property_type: String,
    /// Select/status option names, when applicable
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Target database id for relation properties
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation_target: Option<String>,
}

/// A database's declared schema
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSchema {
    /// Database id
    pub database_id: String,
    /// Database title
    pub title: String,
    /// Declared properties
    pub properties: Vec<PropertySpec>,
}

/// Validation result for one relation property
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationReport {
    /// Relation property name
    pub property: String,
    /// Target database id, if declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_database: Option<String>,
    /// Whether the target database maps to a known entity kind
    pub target_known: bool,
    /// Relation ids inspected
    pub checked: usize,
    /// Ids that no longer resolve in the target database
    pub orphans: usize,
}

/// Schema discovery over the upstream client
pub struct DiscoveryService {
    api: Arc<dyn UpstreamApi>,
}

impl DiscoveryService {
    /// Wrap an upstream client
    pub fn new(api: Arc<dyn UpstreamApi>) -> Self {
        Self { api }
    }

    /// Retrieve and parse the schema of a kind's database
    pub async fn describe(&self, kind: EntityKind) -> UpstreamResult<DatabaseSchema> {
        let raw = self.api.database_schema(kind, PRIORITY_LOW).await?;
        Self::parse_schema(&raw)
    }

    fn parse_schema(raw: &Value) -> UpstreamResult<DatabaseSchema> {
        let database_id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| UpstreamError::SchemaMismatch("schema missing id".to_string()))?
            .to_string();

        let title = raw
            .get("title")
            .and_then(Value::as_array)
            .map(|fragments| {
                fragments
                    .iter()
                    .filter_map(|f| f.get("plain_text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .unwrap_or_default();

        let mut properties = Vec::new();
        if let Some(props) = raw.get("properties").and_then(Value::as_object) {
            for (name, spec) in props {
                let property_type = spec
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();

                let options = spec
                    .get(&property_type)
                    .and_then(|t| t.get("options"))
                    .and_then(Value::as_array)
                    .map(|opts| {
                        opts.iter()
                            .filter_map(|o| o.get("name").and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();

                let relation_target = spec
                    .get("relation")
                    .and_then(|r| r.get("database_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                properties.push(PropertySpec {
                    id: spec
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: name.clone(),
                    property_type,
                    options,
                    relation_target,
                });
            }
        }

        Ok(DatabaseSchema {
            database_id,
            title,
            properties,
        })
    }

    /// Check every relation property of `kind` against its target database
    /// and count orphaned references
    pub async fn validate_relations(
        &self,
        kind: EntityKind,
        map: &DatabaseMap,
    ) -> UpstreamResult<Vec<RelationReport>> {
        let schema = self.describe(kind).await?;
        let relations: Vec<&PropertySpec> = schema
            .properties
            .iter()
            .filter(|p| p.property_type == "relation")
            .collect();
        if relations.is_empty() {
            return Ok(Vec::new());
        }

        let source = self
            .api
            .list_entities(kind, &ListFilter::default(), PRIORITY_LOW)
            .await?;

        let mut reports = Vec::new();
        for property in relations {
            let target_kind = property
                .relation_target
                .as_deref()
                .and_then(|db| map.kind_for(db));

            let (checked, orphans) = match target_kind {
                Some(target) => {
                    let live: HashSet<String> = self
                        .api
                        .list_entities(target, &ListFilter::default(), PRIORITY_LOW)
                        .await?
                        .into_iter()
                        .map(|e| e.id)
                        .collect();

                    let mut checked = 0;
                    let mut orphans = 0;
                    for entity in &source {
                        for id in entity.relation(&property.name) {
                            checked += 1;
                            if !live.contains(id) {
                                orphans += 1;
                            }
                        }
                    }
                    (checked, orphans)
                }
                None => (0, 0),
            };

            info!(
                kind = %kind,
                property = %property.name,
                checked,
                orphans,
                "relation validation"
            );

            reports.push(RelationReport {
                property: property.name.clone(),
                target_database: property.relation_target.clone(),
                target_known: target_kind.is_some(),
                checked,
                orphans,
            });
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_schema() {
        let raw = json!({
            "id": "db-1",
            "title": [{ "plain_text": "Tasks" }],
            "properties": {
                "Title": { "id": "ti", "type": "title", "title": {} },
                "Status": {
                    "id": "st",
                    "type": "status",
                    "status": { "options": [
                        { "name": "not_started" },
                        { "name": "in_progress" },
                        { "name": "completed" }
                    ]}
                },
                "Project": {
                    "id": "pr",
                    "type": "relation",
                    "relation": { "database_id": "db-p" }
                }
            }
        });

        let schema = DiscoveryService::parse_schema(&raw).unwrap();
        assert_eq!(schema.database_id, "db-1");
        assert_eq!(schema.title, "Tasks");
        assert_eq!(schema.properties.len(), 3);

        let status = schema
            .properties
            .iter()
            .find(|p| p.name == "Status")
            .unwrap();
        assert_eq!(status.options.len(), 3);

        let project = schema
            .properties
            .iter()
            .find(|p| p.name == "Project")
            .unwrap();
        assert_eq!(project.relation_target.as_deref(), Some("db-p"));
    }

    #[test]
    fn test_parse_schema_without_id_fails() {
        let raw = json!({ "title": [], "properties": {} });
        assert!(matches!(
            DiscoveryService::parse_schema(&raw),
            Err(UpstreamError::SchemaMismatch(_))
        ));
    }
}
