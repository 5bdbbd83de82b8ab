use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::{AsyncExecutionSteps, ExecutionSteps};
use crate::dynamic::DynamicValue;
use crate::error::QueryResult;
use crate::expression::Expression;
use crate::native::NativeExpr;
use crate::value::Value;

type Hook<T> = Box<dyn Fn(T) -> QueryResult<T> + Send + Sync>;

/// Wraps another backend and post-processes the output of selected steps,
/// leaving the wrapped implementation untouched.
pub struct StepDecorator<S> {
    inner: S,
    after_prepare_portable: Option<Hook<Expression>>,
    after_prepare_native: Option<Hook<NativeExpr>>,
    after_process_result: Option<Hook<Value>>,
    after_process_dynamic: Option<Hook<DynamicValue>>,
}

impl<S> StepDecorator<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            after_prepare_portable: None,
            after_prepare_native: None,
            after_process_result: None,
            after_process_dynamic: None,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn on_prepare_portable(
        mut self,
        hook: impl Fn(Expression) -> QueryResult<Expression> + Send + Sync + 'static,
    ) -> Self {
        self.after_prepare_portable = Some(Box::new(hook));
        self
    }

    pub fn on_prepare_native(
        mut self,
        hook: impl Fn(NativeExpr) -> QueryResult<NativeExpr> + Send + Sync + 'static,
    ) -> Self {
        self.after_prepare_native = Some(Box::new(hook));
        self
    }

    pub fn on_process_result(mut self, hook: impl Fn(Value) -> QueryResult<Value> + Send + Sync + 'static) -> Self {
        self.after_process_result = Some(Box::new(hook));
        self
    }

    pub fn on_process_dynamic_result(
        mut self,
        hook: impl Fn(DynamicValue) -> QueryResult<DynamicValue> + Send + Sync + 'static,
    ) -> Self {
        self.after_process_dynamic = Some(Box::new(hook));
        self
    }
}

fn run<T>(hook: &Option<Hook<T>>, value: T) -> QueryResult<T> {
    match hook {
        Some(hook) => hook(value),
        None => Ok(value),
    }
}

impl<S: ExecutionSteps> ExecutionSteps for StepDecorator<S> {
    fn prepare_portable(&self, expr: Expression) -> QueryResult<Expression> {
        run(&self.after_prepare_portable, self.inner.prepare_portable(expr)?)
    }

    fn translate(&self, expr: &Expression) -> QueryResult<NativeExpr> {
        self.inner.translate(expr)
    }

    fn prepare_native(&self, expr: NativeExpr) -> QueryResult<NativeExpr> {
        run(&self.after_prepare_native, self.inner.prepare_native(expr)?)
    }

    fn execute(&self, expr: &NativeExpr) -> QueryResult<Value> {
        self.inner.execute(expr)
    }

    fn process_result(&self, value: Value) -> QueryResult<Value> {
        run(&self.after_process_result, self.inner.process_result(value)?)
    }

    fn convert_to_dynamic(&self, value: &Value) -> QueryResult<DynamicValue> {
        self.inner.convert_to_dynamic(value)
    }

    fn process_dynamic_result(&self, value: DynamicValue) -> QueryResult<DynamicValue> {
        run(&self.after_process_dynamic, self.inner.process_dynamic_result(value)?)
    }
}

#[async_trait]
impl<S: AsyncExecutionSteps> AsyncExecutionSteps for StepDecorator<S> {
    async fn execute_async(&self, expr: &NativeExpr, cancel: &CancellationToken) -> QueryResult<Value> {
        self.inner.execute_async(expr, cancel).await
    }

    fn execute_stream(&self, expr: &NativeExpr) -> Option<BoxStream<'static, QueryResult<Value>>> {
        self.inner.execute_stream(expr)
    }
}
