//! In-memory backend: native evaluator over a data source provider.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};

use super::{unwrap_elements, yields_sequence, AsyncExecutionSteps, ExecutionSteps};
use crate::dynamic::{DynamicObjectMapper, DynamicValue, MapperConfig};
use crate::error::QueryResult;
use crate::eval::evaluate;
use crate::expression::Expression;
use crate::native::NativeExpr;
use crate::source::DataSourceProvider;
use crate::translate::{to_native_with_provider, RewriteChain, StripIncludes};
use crate::types::TypeResolver;
use crate::value::Value;

pub struct InMemoryExecutor {
    resolver: Arc<dyn TypeResolver>,
    provider: Arc<dyn DataSourceProvider>,
    mapper: DynamicObjectMapper,
    rewrites: RewriteChain,
    streaming: bool,
}

impl InMemoryExecutor {
    /// Include markers are stripped: every member of an in-memory row is
    /// already loaded.
    pub fn new(resolver: Arc<dyn TypeResolver>, provider: Arc<dyn DataSourceProvider>) -> Self {
        let mapper = DynamicObjectMapper::new(MapperConfig::default()).with_resolver(resolver.clone());
        Self {
            resolver,
            provider,
            mapper,
            rewrites: RewriteChain::new().with(StripIncludes),
            streaming: false,
        }
    }

    pub fn with_mapper_config(mut self, config: MapperConfig) -> Self {
        self.mapper = DynamicObjectMapper::new(config).with_resolver(self.resolver.clone());
        self
    }

    pub fn with_rewrites(mut self, rewrites: RewriteChain) -> Self {
        self.rewrites = rewrites;
        self
    }

    /// Serve results through `execute_stream` instead of one value.
    pub fn streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    pub fn resolver(&self) -> &Arc<dyn TypeResolver> {
        &self.resolver
    }

    pub fn mapper(&self) -> &DynamicObjectMapper {
        &self.mapper
    }
}

impl ExecutionSteps for InMemoryExecutor {
    fn translate(&self, expr: &Expression) -> QueryResult<NativeExpr> {
        to_native_with_provider(expr, &self.resolver, self.provider.as_ref())
    }

    fn prepare_native(&self, expr: NativeExpr) -> QueryResult<NativeExpr> {
        self.rewrites.apply(expr)
    }

    fn execute(&self, expr: &NativeExpr) -> QueryResult<Value> {
        tracing::debug!("Executing {}", expr);
        evaluate(expr)
    }

    fn convert_to_dynamic(&self, value: &Value) -> QueryResult<DynamicValue> {
        self.mapper.to_dynamic(value)
    }
}

#[async_trait]
impl AsyncExecutionSteps for InMemoryExecutor {
    fn execute_stream(&self, expr: &NativeExpr) -> Option<BoxStream<'static, QueryResult<Value>>> {
        if !self.streaming {
            return None;
        }
        let sequence = yields_sequence(&expr.ty());
        let expr = expr.clone();
        let lazy = stream::once(async move { evaluate(&expr) });
        Some(
            lazy.map_ok(move |value| {
                let items = if sequence { unwrap_elements(value) } else { vec![value] };
                stream::iter(items.into_iter().map(Ok))
            })
            .try_flatten()
            .boxed(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::native::Query;
    use crate::pipeline::{execute, execute_async, execute_stream, StepDecorator};
    use crate::source::{InMemorySource, OnceSource, SourceCatalog};
    use crate::translate::to_portable;
    use crate::types::{FieldDef, NativeType, TypeRegistry};
    use crate::value::ObjectRef;
    use tokio_util::sync::CancellationToken;

    fn item() -> NativeType {
        NativeType::record(
            "Item",
            vec![
                FieldDef::new("Name", NativeType::string()),
                FieldDef::new("Qty", NativeType::i32()),
            ],
        )
    }

    fn row(name: &str, qty: i32) -> Value {
        Value::Object(ObjectRef::new(&item(), vec![Value::from(name), Value::I32(qty)]).unwrap())
    }

    fn executor() -> InMemoryExecutor {
        let registry = TypeRegistry::new();
        registry.register(item()).unwrap();
        let catalog = SourceCatalog::new();
        catalog.add(InMemorySource::shared(
            item(),
            vec![row("bolt", 40), row("nut", 5), row("gear", 12)],
        ));
        InMemoryExecutor::new(Arc::new(registry), Arc::new(catalog))
    }

    fn big_items() -> Expression {
        let q = Query::resource(item())
            .filter(|x| x.member("Qty")?.gt(NativeExpr::constant(10, NativeType::i32())))
            .unwrap()
            .order_by(|x| x.member("Name"))
            .unwrap()
            .select(|x| x.member("Name"))
            .unwrap();
        to_portable(q.expr()).unwrap()
    }

    #[test]
    fn test_execute_sync() {
        let result = execute(&executor(), big_items()).unwrap();
        assert_eq!(
            result,
            DynamicValue::List(vec![DynamicValue::from("bolt"), DynamicValue::from("gear")])
        );
    }

    #[tokio::test]
    async fn test_stream_unwraps_single_result() {
        let steps: Arc<dyn AsyncExecutionSteps> = Arc::new(executor());
        let stream = execute_stream(steps, big_items(), CancellationToken::new()).await.unwrap();
        let names: Vec<DynamicValue> = stream.try_collect().await.unwrap();
        assert_eq!(names, vec![DynamicValue::from("bolt"), DynamicValue::from("gear")]);
    }

    #[tokio::test]
    async fn test_streaming_backend_materializes_for_single_request() {
        let steps = executor().streaming(true);
        let count = Query::resource(item()).count().unwrap();
        let result = execute_async(&steps, to_portable(&count).unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, DynamicValue::I32(3));
    }

    #[test]
    fn test_cancelled_request_is_refused() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tokio_test::block_on(execute_async(&executor(), big_items(), &cancel));
        assert!(matches!(result, Err(QueryError::Cancelled)));
    }

    #[test]
    fn test_decorator_post_processes_result() {
        let decorated = StepDecorator::new(executor()).on_process_result(|value| match value {
            Value::List(items) => Ok(Value::I32(items.len() as i32)),
            other => Ok(other),
        });
        assert_eq!(execute(&decorated, big_items()).unwrap(), DynamicValue::I32(2));
    }

    #[test]
    fn test_once_source_enumerated_twice_fails() {
        let registry = TypeRegistry::new();
        registry.register(item()).unwrap();
        let once: Arc<dyn crate::source::DataSource> = Arc::new(OnceSource::new(item(), vec![row("a", 1)]));
        let provider = move |_: &NativeType| -> QueryResult<Arc<dyn crate::source::DataSource>> { Ok(once.clone()) };
        let steps = InMemoryExecutor::new(Arc::new(registry), Arc::new(provider));
        let all = to_portable(Query::resource(item()).expr()).unwrap();
        assert!(execute(&steps, all.clone()).is_ok());
        assert!(matches!(execute(&steps, all), Err(QueryError::AlreadyEnumerated)));
    }
}
