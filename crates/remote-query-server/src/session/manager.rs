//! Dataset loading and the executor that serves it.
//!
//! A dataset is a JSON document declaring named types and the rows of
//! each source:
//!
//! ```json
//! {
//!   "types": [
//!     { "name": "Status", "variants": ["Open", "Closed"] },
//!     { "name": "Order", "fields": [{ "name": "Id", "type": "i32" },
//!                                   { "name": "Status", "type": "Status" }] }
//!   ],
//!   "sources": { "Order": [{ "Id": 1, "Status": "Open" }] }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use remote_query::{
    DynamicObjectMapper, DynamicValue, FieldDef, InMemoryExecutor, InMemorySource, NativeType,
    RecordRef, SourceCatalog, TypeInfo, TypeRegistry, TypeResolver,
};

use crate::types::{ServerError, ServerResult};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub types: Vec<TypeDecl>,
    #[serde(default)]
    pub sources: BTreeMap<String, Vec<serde_json::Value>>,
}

/// A record (with `fields`) or an enum (with `variants`).
#[derive(Debug, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldDecl>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// Loaded types and sources, plus the in-memory executor over them.
pub struct DataSession {
    registry: Arc<TypeRegistry>,
    catalog: Arc<SourceCatalog>,
    executor: Arc<InMemoryExecutor>,
    file_path: Option<PathBuf>,
}

impl DataSession {
    /// Load a dataset file.
    pub fn open(path: impl AsRef<Path>) -> ServerResult<Self> {
        let file_path = path.as_ref().to_path_buf();
        tracing::info!("Loading dataset: {}", file_path.display());
        let text = std::fs::read_to_string(&file_path).map_err(|e| {
            ServerError::Session(format!("Failed to read {}: {e}", file_path.display()))
        })?;
        let dataset: Dataset = serde_json::from_str(&text).map_err(|e| {
            ServerError::Session(format!("Invalid dataset {}: {e}", file_path.display()))
        })?;
        let mut session = Self::from_dataset(dataset)?;
        session.file_path = Some(file_path);
        Ok(session)
    }

    /// Load the dataset if the file exists, otherwise start empty.
    pub fn open_or_empty(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            tracing::warn!("Dataset {} not found, serving an empty catalog", path.display());
            Ok(Self::empty())
        }
    }

    pub fn empty() -> Self {
        Self::assemble(Arc::new(TypeRegistry::new()), Arc::new(SourceCatalog::new()))
    }

    pub fn from_dataset(dataset: Dataset) -> ServerResult<Self> {
        let registry = Arc::new(TypeRegistry::new());

        // Declare everything first so fields may reference any named type.
        let mut records = Vec::new();
        for decl in &dataset.types {
            match (&decl.fields, &decl.variants) {
                (Some(fields), None) => {
                    let ty = NativeType::declare_record(decl.name.as_str());
                    registry.register(ty.clone())?;
                    records.push((ty, fields));
                }
                (None, Some(variants)) => {
                    registry.register(NativeType::enumeration(decl.name.as_str(), variants.clone()))?;
                }
                _ => {
                    return Err(ServerError::Session(format!(
                        "Type '{}' needs exactly one of 'fields' or 'variants'",
                        decl.name
                    )))
                }
            }
        }
        for (ty, fields) in records {
            let defs = fields
                .iter()
                .map(|f| {
                    let info: TypeInfo = f.ty.parse()?;
                    Ok(FieldDef::new(f.name.as_str(), registry.resolve_type(&info)?))
                })
                .collect::<ServerResult<Vec<_>>>()?;
            ty.define_fields(defs)?;
        }

        let catalog = Arc::new(SourceCatalog::new());
        let mapper = DynamicObjectMapper::default();
        for (name, rows) in &dataset.sources {
            let ty = registry
                .get(name)
                .filter(NativeType::is_record)
                .ok_or_else(|| ServerError::Session(format!("Source '{name}' has no record type")))?;
            let values = rows
                .iter()
                .map(|row| mapper.from_dynamic(&json_to_dynamic(row), &ty))
                .collect::<Result<Vec<_>, _>>()?;
            tracing::debug!("Source {name}: {} rows", values.len());
            catalog.add(InMemorySource::shared(ty, values));
        }

        tracing::info!(
            "Dataset ready: {} types, {} sources",
            registry.named_types().len(),
            catalog.len()
        );
        Ok(Self::assemble(registry, catalog))
    }

    fn assemble(registry: Arc<TypeRegistry>, catalog: Arc<SourceCatalog>) -> Self {
        let executor = InMemoryExecutor::new(registry.clone(), catalog.clone()).streaming(true);
        Self {
            registry,
            catalog,
            executor: Arc::new(executor),
            file_path: None,
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<SourceCatalog> {
        &self.catalog
    }

    pub fn executor(&self) -> Arc<InMemoryExecutor> {
        self.executor.clone()
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn type_names(&self) -> Vec<String> {
        self.registry
            .named_types()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Source names with their row counts.
    pub fn source_counts(&self) -> Vec<(String, usize)> {
        self.catalog
            .names()
            .into_iter()
            .map(|name| {
                let rows = self.catalog.get(&name).and_then(|s| s.row_count()).unwrap_or(0);
                (name, rows)
            })
            .collect()
    }
}

/// Plain JSON into the dynamic model. Objects become untyped records;
/// the mapper assigns them to the declared type.
pub fn json_to_dynamic(value: &serde_json::Value) -> DynamicValue {
    use serde_json::Value as J;
    match value {
        J::Null => DynamicValue::Null,
        J::Bool(b) => DynamicValue::Bool(*b),
        J::Number(n) => {
            if let Some(i) = n.as_i64() {
                DynamicValue::I64(i)
            } else if let Some(u) = n.as_u64() {
                DynamicValue::U64(u)
            } else {
                DynamicValue::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        J::String(s) => DynamicValue::String(s.clone()),
        J::Array(items) => DynamicValue::List(items.iter().map(json_to_dynamic).collect()),
        J::Object(map) => DynamicValue::Record(RecordRef::from_properties(
            None,
            map.iter().map(|(k, v)| (k.clone(), json_to_dynamic(v))),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dataset(value: serde_json::Value) -> Dataset {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_loads_records_enums_and_rows() {
        let session = DataSession::from_dataset(dataset(json!({
            "types": [
                {"name": "Order", "fields": [
                    {"name": "Id", "type": "i32"},
                    {"name": "Status", "type": "Status"},
                    {"name": "Lines", "type": "List<Line>"}
                ]},
                {"name": "Line", "fields": [{"name": "Sku", "type": "string"}]},
                {"name": "Status", "variants": ["Open", "Closed"]}
            ],
            "sources": {
                "Order": [
                    {"Id": 1, "Status": "Open", "Lines": [{"Sku": "a"}]},
                    {"Id": 2, "Status": "Closed", "Lines": []}
                ]
            }
        })))
        .unwrap();

        assert_eq!(session.type_names(), vec!["Line", "Order", "Status"]);
        assert_eq!(session.source_counts(), vec![("Order".to_string(), 2)]);
    }

    #[test]
    fn test_unknown_field_type_fails() {
        let err = DataSession::from_dataset(dataset(json!({
            "types": [{"name": "Order", "fields": [{"name": "Id", "type": "Missing"}]}]
        })))
        .err()
        .unwrap();
        assert!(matches!(err, ServerError::Query(_)));
    }

    #[test]
    fn test_source_without_type_fails() {
        let err = DataSession::from_dataset(dataset(json!({"sources": {"Ghost": []}})))
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Session(_)));
    }

    #[test]
    fn test_open_or_empty_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = DataSession::open_or_empty(dir.path().join("absent.json")).unwrap();
        assert!(session.type_names().is_empty());
        assert!(session.file_path().is_none());
    }
}
