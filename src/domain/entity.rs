//! Generic upstream entities
//!
//! Projects, clients, members and teams are opaque to this system except for
//! their ids, display names and relation fields. Relations hold only ids;
//! resolving them goes through the cache manager's batch loaders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An upstream entity of any non-task kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Upstream id
    pub id: String,

    /// Display name
    pub name: String,

    /// Relation fields, keyed by property name, holding target ids only
    #[serde(default)]
    pub relations: HashMap<String, Vec<String>>,

    /// Whether the entity is archived upstream
    #[serde(default)]
    pub archived: bool,

    /// Upstream creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Upstream last-modified time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EntityRecord {
    /// Ids a relation field points at, empty when the field is absent
    pub fn relation(&self, field: &str) -> &[String] {
        self.relations
            .get(field)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_relation_is_empty() {
        let entity = EntityRecord {
            id: "p1".into(),
            name: "Project".into(),
            relations: HashMap::new(),
            archived: false,
            created_at: None,
            updated_at: None,
        };
        assert!(entity.relation("client").is_empty());
    }
}
