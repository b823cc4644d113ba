//! Model catalog: which models the HTTP surface exposes, under which path, with which
//! operations. Loaded once at startup; schemas are shared with the model registry.

use crate::error::ConfigError;
use crate::schema::ModelSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const OPERATIONS: &[&str] = &["create", "read", "update", "delete"];

fn all_operations() -> Vec<String> {
    OPERATIONS.iter().map(|s| s.to_string()).collect()
}

/// One catalog entry as stored in the models JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Model name passed to the registry (e.g. "News").
    pub name: String,
    /// URL path segment. Defaults to the collection name.
    #[serde(default)]
    pub path_segment: Option<String>,
    #[serde(default = "all_operations")]
    pub operations: Vec<String>,
    #[serde(default)]
    pub schema: ModelSchema,
}

#[derive(Clone, Debug)]
pub struct CatalogModel {
    pub name: String,
    pub operations: Vec<String>,
    pub schema: Arc<ModelSchema>,
}

impl CatalogModel {
    pub fn allows(&self, operation: &str) -> bool {
        self.operations.iter().any(|o| o == operation)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModelCatalog {
    by_path: HashMap<String, CatalogModel>,
}

impl ModelCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, ConfigError> {
        let mut by_path = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Validation("catalog entry with empty model name".into()));
            }
            if let Some(op) = entry.operations.iter().find(|o| !OPERATIONS.contains(&o.as_str())) {
                return Err(ConfigError::Validation(format!(
                    "model '{}': unknown operation '{}'",
                    entry.name, op
                )));
            }
            entry
                .schema
                .check_patterns()
                .map_err(|e| ConfigError::Validation(format!("model '{}': {}", entry.name, e)))?;
            let path = entry
                .path_segment
                .clone()
                .unwrap_or_else(|| entry.schema.collection_name(&entry.name));
            let model = CatalogModel {
                name: entry.name,
                operations: entry.operations,
                schema: Arc::new(entry.schema),
            };
            if let Some(previous) = by_path.insert(path.clone(), model) {
                return Err(ConfigError::Validation(format!(
                    "path '{}' used by more than one model ('{}')",
                    path, previous.name
                )));
            }
        }
        Ok(ModelCatalog { by_path })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let entries: Vec<CatalogEntry> =
            serde_json::from_str(raw).map_err(|e| ConfigError::Load(format!("model catalog: {}", e)))?;
        Self::new(entries)
    }

    pub async fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let catalog = Self::from_json_str(&raw)?;
        tracing::info!(path = %path.display(), models = catalog.len(), "model catalog loaded");
        Ok(catalog)
    }

    pub fn get(&self, path_segment: &str) -> Option<&CatalogModel> {
        self.by_path.get(path_segment)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    const CATALOG: &str = r#"[
        {"name": "News", "schema": {"fields": {"title": {"type": "string", "required": true}}}},
        {"name": "Order", "path_segment": "orders", "operations": ["read"],
         "schema": {"strict": false, "fields": {"total": {"type": "number", "minimum": 0}}}}
    ]"#;

    #[test]
    fn loads_entries_by_path() {
        let catalog = ModelCatalog::from_json_str(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);

        let news = catalog.get("news").unwrap();
        assert_eq!(news.name, "News");
        assert!(news.allows("create") && news.allows("delete"));
        assert_eq!(news.schema.fields["title"].kind, FieldKind::String);

        let orders = catalog.get("orders").unwrap();
        assert!(orders.allows("read"));
        assert!(!orders.allows("create"));
        assert!(!orders.schema.strict);
        assert!(catalog.get("News").is_none());
    }

    #[test]
    fn rejects_duplicates_unknown_operations_and_bad_patterns() {
        let dup = r#"[{"name": "News"}, {"name": "Other", "path_segment": "news"}]"#;
        assert!(matches!(ModelCatalog::from_json_str(dup), Err(ConfigError::Validation(_))));
        let bad_op = r#"[{"name": "News", "operations": ["truncate"]}]"#;
        assert!(matches!(ModelCatalog::from_json_str(bad_op), Err(ConfigError::Validation(_))));
        let bad_pattern = r#"[{"name": "News", "schema": {"fields": {"code": {"type": "string", "pattern": "([x"}}}}]"#;
        assert!(matches!(
            ModelCatalog::from_json_str(bad_pattern),
            Err(ConfigError::Validation(m)) if m.contains("code")
        ));
        assert!(matches!(ModelCatalog::from_json_str("{"), Err(ConfigError::Load(_))));
    }

    #[tokio::test]
    async fn load_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        std::fs::write(&path, CATALOG).unwrap();
        assert_eq!(ModelCatalog::load_file(&path).await.unwrap().len(), 2);
        assert!(ModelCatalog::load_file(&dir.path().join("missing.json")).await.is_err());
    }
}
