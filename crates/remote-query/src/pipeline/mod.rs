//! Execution pipeline for portable queries.
//!
//! A request runs through seven steps:
//! `prepare_portable -> translate -> prepare_native -> execute ->
//! process_result -> convert_to_dynamic -> process_dynamic_result`.
//! Backends implement [`ExecutionSteps`] (and optionally
//! [`AsyncExecutionSteps`]); the free functions in this module drive the
//! steps in order for the three request shapes.

mod decorator;
mod memory;

pub use decorator::StepDecorator;
pub use memory::InMemoryExecutor;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::dynamic::DynamicValue;
use crate::error::{QueryError, QueryResult};
use crate::expression::Expression;
use crate::native::NativeExpr;
use crate::types::{NativeType, TypeKind};
use crate::value::Value;

/// The backend execution hook. Only `translate`, `execute` and
/// `convert_to_dynamic` have no sensible default.
pub trait ExecutionSteps: Send + Sync {
    fn prepare_portable(&self, expr: Expression) -> QueryResult<Expression> {
        Ok(expr)
    }

    fn translate(&self, expr: &Expression) -> QueryResult<NativeExpr>;

    fn prepare_native(&self, expr: NativeExpr) -> QueryResult<NativeExpr> {
        Ok(expr)
    }

    fn execute(&self, expr: &NativeExpr) -> QueryResult<Value>;

    fn process_result(&self, value: Value) -> QueryResult<Value> {
        Ok(value)
    }

    fn convert_to_dynamic(&self, value: &Value) -> QueryResult<DynamicValue>;

    fn process_dynamic_result(&self, value: DynamicValue) -> QueryResult<DynamicValue> {
        Ok(value)
    }
}

/// Asynchronous execution. A backend that can produce its result
/// incrementally returns a stream from `execute_stream`.
#[async_trait]
pub trait AsyncExecutionSteps: ExecutionSteps {
    async fn execute_async(&self, expr: &NativeExpr, cancel: &CancellationToken) -> QueryResult<Value> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        self.execute(expr)
    }

    fn execute_stream(&self, _expr: &NativeExpr) -> Option<BoxStream<'static, QueryResult<Value>>> {
        None
    }
}

fn prepare<S: ExecutionSteps + ?Sized>(steps: &S, expr: Expression) -> QueryResult<NativeExpr> {
    let portable = steps.prepare_portable(expr)?;
    let native = steps.translate(&portable)?;
    steps.prepare_native(native)
}

fn finish<S: ExecutionSteps + ?Sized>(steps: &S, value: Value) -> QueryResult<DynamicValue> {
    let value = steps.process_result(value)?;
    let dynamic = steps.convert_to_dynamic(&value)?;
    steps.process_dynamic_result(dynamic)
}

/// Whether a tree of this type produces a sequence rather than one value.
pub(crate) fn yields_sequence(ty: &NativeType) -> bool {
    matches!(ty.kind(), TypeKind::List(_) | TypeKind::Array(_) | TypeKind::Queryable(_))
}

/// Splits a single result into stream elements: a list yields its items,
/// null yields nothing, anything else yields itself.
pub(crate) fn unwrap_elements(value: Value) -> Vec<Value> {
    match value {
        Value::List(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Runs a request synchronously.
pub fn execute<S: ExecutionSteps + ?Sized>(steps: &S, expr: Expression) -> QueryResult<DynamicValue> {
    let native = prepare(steps, expr)?;
    let value = steps.execute(&native)?;
    finish(steps, value)
}

async fn run_single<S: AsyncExecutionSteps + ?Sized>(
    steps: &S,
    native: &NativeExpr,
    cancel: &CancellationToken,
) -> QueryResult<Value> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(QueryError::Cancelled),
        result = steps.execute_async(native, cancel) => result,
    }
}

async fn materialize(
    mut stream: BoxStream<'static, QueryResult<Value>>,
    ty: &NativeType,
    cancel: &CancellationToken,
) -> QueryResult<Value> {
    let mut items = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            next = stream.next() => match next {
                Some(item) => items.push(item?),
                None => break,
            },
        }
    }
    if yields_sequence(ty) {
        return Ok(Value::List(items));
    }
    match items.len() {
        1 => Ok(items.pop().unwrap_or(Value::Null)),
        count => Err(QueryError::EmptyOrOversizedResult { count }),
    }
}

/// Runs a request for a single result. A stream-only backend has its
/// stream materialized.
pub async fn execute_async<S: AsyncExecutionSteps + ?Sized>(
    steps: &S,
    expr: Expression,
    cancel: &CancellationToken,
) -> QueryResult<DynamicValue> {
    let native = prepare(steps, expr)?;
    let value = match steps.execute_stream(&native) {
        Some(stream) => materialize(stream, &native.ty(), cancel).await?,
        None => run_single(steps, &native, cancel).await?,
    };
    finish(steps, value)
}

/// Runs a request as a stream of dynamic elements. Without a streaming
/// backend, the single result is unwrapped into elements.
pub async fn execute_stream(
    steps: Arc<dyn AsyncExecutionSteps>,
    expr: Expression,
    cancel: CancellationToken,
) -> QueryResult<BoxStream<'static, QueryResult<DynamicValue>>> {
    let native = prepare(steps.as_ref(), expr)?;
    let values = match steps.execute_stream(&native) {
        Some(stream) => stream,
        None => {
            let result = run_single(steps.as_ref(), &native, &cancel).await?;
            stream::iter(unwrap_elements(result).into_iter().map(Ok)).boxed()
        }
    };
    let elements = values.map(move |item| {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        finish(steps.as_ref(), item?)
    });
    Ok(elements.boxed())
}
