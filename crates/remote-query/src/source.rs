//! Data sources and the providers that hand them to the translator.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{QueryError, QueryResult};
use crate::types::NativeType;
use crate::value::Value;

/// A live collection a query runs against.
pub trait DataSource: Send + Sync {
    fn element_type(&self) -> &NativeType;

    /// Materializes the elements.
    fn scan(&self) -> QueryResult<Vec<Value>>;

    fn name(&self) -> &str {
        self.element_type().name()
    }

    /// Row count when known without scanning.
    fn row_count(&self) -> Option<usize> {
        None
    }
}

impl fmt::Debug for dyn DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataSource({})", self.name())
    }
}

/// A data source backed by a vector held in memory.
pub struct InMemorySource {
    element_type: NativeType,
    rows: RwLock<Vec<Value>>,
}

impl InMemorySource {
    pub fn new(element_type: NativeType, rows: Vec<Value>) -> Self {
        Self {
            element_type,
            rows: RwLock::new(rows),
        }
    }

    pub fn shared(element_type: NativeType, rows: Vec<Value>) -> Arc<dyn DataSource> {
        Arc::new(Self::new(element_type, rows))
    }

    pub fn push(&self, row: Value) {
        self.rows.write().push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl DataSource for InMemorySource {
    fn element_type(&self) -> &NativeType {
        &self.element_type
    }

    fn scan(&self) -> QueryResult<Vec<Value>> {
        Ok(self.rows.read().clone())
    }

    fn row_count(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// A source that can be enumerated exactly once, like a forward-only reader.
pub struct OnceSource {
    element_type: NativeType,
    rows: Mutex<Option<Vec<Value>>>,
}

impl OnceSource {
    pub fn new(element_type: NativeType, rows: Vec<Value>) -> Self {
        Self {
            element_type,
            rows: Mutex::new(Some(rows)),
        }
    }
}

impl DataSource for OnceSource {
    fn element_type(&self) -> &NativeType {
        &self.element_type
    }

    fn scan(&self) -> QueryResult<Vec<Value>> {
        self.rows.lock().take().ok_or(QueryError::AlreadyEnumerated)
    }
}

/// Hands out the data source for an element type. Closures of the right
/// shape are providers too.
pub trait DataSourceProvider: Send + Sync {
    fn provide(&self, element_type: &NativeType) -> QueryResult<Arc<dyn DataSource>>;
}

impl<F> DataSourceProvider for F
where
    F: Fn(&NativeType) -> QueryResult<Arc<dyn DataSource>> + Send + Sync,
{
    fn provide(&self, element_type: &NativeType) -> QueryResult<Arc<dyn DataSource>> {
        self(element_type)
    }
}

/// Data sources keyed by element type name.
#[derive(Default)]
pub struct SourceCatalog {
    sources: RwLock<HashMap<String, Arc<dyn DataSource>>>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, source: Arc<dyn DataSource>) {
        tracing::debug!("Adding data source for {}", source.element_type());
        self.sources
            .write()
            .insert(source.element_type().name().to_string(), source);
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.read().get(type_name).cloned()
    }

    /// Element type names with a source, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

impl DataSourceProvider for SourceCatalog {
    fn provide(&self, element_type: &NativeType) -> QueryResult<Arc<dyn DataSource>> {
        self.get(element_type.name()).ok_or_else(|| {
            QueryError::TypeResolution(format!("No data source for '{element_type}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_source_fails_on_second_scan() {
        let source = OnceSource::new(NativeType::i32(), vec![Value::I32(1)]);
        assert_eq!(source.scan().unwrap().len(), 1);
        assert!(matches!(source.scan(), Err(QueryError::AlreadyEnumerated)));
    }

    #[test]
    fn test_catalog_provides_by_type_name() {
        let catalog = SourceCatalog::new();
        catalog.add(InMemorySource::shared(NativeType::string(), vec![Value::from("a")]));
        assert_eq!(catalog.names(), vec!["string"]);
        assert!(catalog.provide(&NativeType::string()).is_ok());
        assert!(catalog.provide(&NativeType::i32()).is_err());
    }

    #[test]
    fn test_closure_is_a_provider() {
        let provider = |ty: &NativeType| -> QueryResult<Arc<dyn DataSource>> {
            Ok(InMemorySource::shared(ty.clone(), Vec::new()))
        };
        let source = provider.provide(&NativeType::f64()).unwrap();
        assert_eq!(source.name(), "f64");
    }
}
