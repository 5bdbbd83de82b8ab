//! RemoteQuery core engine for shipping queries across a process boundary:
//! portable expression trees, structural object mapping and an execution
//! pipeline with an in-memory backend.

pub mod dynamic;
pub mod error;
pub mod eval;
pub mod expression;
pub mod native;
pub mod pipeline;
pub mod query_descriptor;
pub mod source;
pub mod translate;
pub mod types;
pub mod value;

pub use dynamic::{DynamicObjectMapper, DynamicRecord, DynamicValue, MapperConfig, RecordRef, TypeInfoPolicy};
pub use error::{QueryError, QueryResult};
pub use expression::Expression;
pub use native::{Method, NativeExpr, ParamRef, Query};
pub use pipeline::{AsyncExecutionSteps, ExecutionSteps, InMemoryExecutor, StepDecorator};
pub use query_descriptor::QueryDescriptor;
pub use source::{DataSource, DataSourceProvider, InMemorySource, OnceSource, SourceCatalog};
pub use translate::{to_native, to_native_with_provider, to_portable, TranslationOptions};
pub use types::{FieldDef, NativeType, TypeInfo, TypeRegistry, TypeResolver};
pub use value::{ObjectRef, Value};
