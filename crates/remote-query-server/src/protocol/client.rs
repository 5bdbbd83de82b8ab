//! Remote execution of native queries.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};

use remote_query::{
    to_portable, DynamicObjectMapper, DynamicValue, Expression, NativeExpr, NativeType, QueryError,
    QueryResult, Value,
};

use super::cursor::{Connector, StreamCursor};
use crate::types::{ClientMessage, ServerMessage};

/// Sends queries to an executing peer and maps results back to native
/// values.
#[derive(Clone)]
pub struct RemoteQueryClient {
    connector: Arc<dyn Connector>,
    mapper: DynamicObjectMapper,
}

impl RemoteQueryClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            mapper: DynamicObjectMapper::default(),
        }
    }

    pub fn with_mapper(mut self, mapper: DynamicObjectMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// One request, one `QueryResult`.
    pub async fn execute(&self, expression: Expression) -> QueryResult<DynamicValue> {
        let outcome = self.request(expression).await;
        self.connector.release();
        outcome
    }

    async fn request(&self, expression: Expression) -> QueryResult<DynamicValue> {
        let mut conn = self.connector.connect().await?;
        conn.send(&ClientMessage::Query { expression }).await?;
        let reply = conn.recv().await?;
        if let Err(e) = conn.close().await {
            tracing::debug!("Close failed: {e}");
        }
        match reply {
            Some(ServerMessage::QueryResult { result }) => Ok(result),
            Some(ServerMessage::Error(e)) => Err(e.into()),
            Some(other) => Err(QueryError::ProtocolDesync(format!(
                "expected query_result, got {}",
                other.name()
            ))),
            None => Err(QueryError::ProtocolDesync(
                "connection closed without a result".into(),
            )),
        }
    }

    /// A cursor over the results. Nothing is sent until the first pull.
    pub fn stream(&self, expression: Expression) -> StreamCursor {
        StreamCursor::new(self.connector.clone(), expression)
    }

    /// Run a native query remotely and rebuild its result as `query.ty()`.
    pub async fn execute_native(&self, query: &NativeExpr) -> QueryResult<Value> {
        let expression = to_portable(query)?;
        let result = self.execute(expression).await?;
        self.mapper.from_dynamic(&result, &query.ty())
    }

    /// Stream a native sequence query, rebuilding each element.
    pub fn stream_native(&self, query: &NativeExpr) -> QueryResult<BoxStream<'static, QueryResult<Value>>> {
        let ty = query.ty();
        let element_type: NativeType = ty.element_type().ok_or_else(|| {
            QueryError::translation(query.node_name(), format!("'{ty}' is not a sequence"))
        })?;
        let expression = to_portable(query)?;
        let mapper = self.mapper.clone();
        let items = self
            .stream(expression)
            .into_stream()
            .map(move |item| item.and_then(|dv| mapper.from_dynamic(&dv, &element_type)));
        Ok(items.boxed())
    }
}
