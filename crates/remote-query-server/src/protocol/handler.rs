//! Executing side of the protocol: one connection at a time, one open
//! stream per connection.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use remote_query::pipeline::{execute_async, execute_stream};
use remote_query::{AsyncExecutionSteps, DynamicValue, Expression, QueryError, QueryResult};

use crate::transport::framing::{parse_message, Framed};
use crate::types::*;

struct ActiveStream {
    items: BoxStream<'static, QueryResult<DynamicValue>>,
    /// Sequence number the next `Next` must carry.
    expected: u64,
}

/// Per-connection protocol state.
pub struct ConnectionState {
    stream: Option<ActiveStream>,
    cancel: CancellationToken,
}

impl ConnectionState {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { stream: None, cancel }
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    fn drop_stream(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Stream closed");
        }
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Dispatches client messages to an execution backend.
#[derive(Clone)]
pub struct ProtocolHandler {
    steps: Arc<dyn AsyncExecutionSteps>,
    shutdown: CancellationToken,
}

impl ProtocolHandler {
    pub fn new(steps: Arc<dyn AsyncExecutionSteps>) -> Self {
        Self {
            steps,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token ends every connection served by the handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve one connection until EOF or shutdown.
    pub async fn serve_connection<R, W>(&self, reader: R, writer: W) -> ServerResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(reader, writer);
        let mut conn = ConnectionState::new(self.shutdown.child_token());
        let cancel = conn.cancel.clone();

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Connection cancelled");
                    break;
                }
                line = framed.recv_line() => line?,
            };
            let Some(line) = line else {
                tracing::debug!("Peer closed the connection");
                break;
            };

            let reply = match parse_message::<ClientMessage>(&line) {
                Ok(msg) => self.handle_message(&mut conn, msg).await,
                Err(e) => {
                    tracing::warn!("Parse error: {e}");
                    Some(e.to_message())
                }
            };
            if let Some(reply) = reply {
                framed.send(&reply).await?;
            }
        }

        conn.drop_stream();
        framed.shutdown().await.ok();
        Ok(())
    }

    /// Handle one message. `StreamQuery` has no reply of its own.
    pub async fn handle_message(&self, conn: &mut ConnectionState, msg: ClientMessage) -> Option<ServerMessage> {
        tracing::debug!("Received {}", msg.name());
        match msg {
            ClientMessage::Query { expression } => Some(self.handle_query(conn.cancel.clone(), expression).await),
            ClientMessage::StreamQuery { expression } => {
                self.open_stream(conn, expression).await;
                None
            }
            ClientMessage::Next { sequence_number } => Some(self.handle_next(conn, sequence_number).await),
        }
    }

    async fn handle_query(&self, cancel: CancellationToken, expression: Expression) -> ServerMessage {
        match execute_async(self.steps.as_ref(), expression, &cancel).await {
            Ok(result) => ServerMessage::QueryResult { result },
            Err(e) => {
                tracing::warn!("Query failed: {e}");
                ServerError::from(e).to_message()
            }
        }
    }

    async fn open_stream(&self, conn: &mut ConnectionState, expression: Expression) {
        if conn.has_stream() {
            tracing::debug!("Replacing the open stream");
        }
        // A failure to start surfaces on the first `Next`.
        let items = match execute_stream(self.steps.clone(), expression, conn.cancel.child_token()).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Stream failed to start: {e}");
                stream::once(async move { Err(e) }).boxed()
            }
        };
        conn.stream = Some(ActiveStream { items, expected: 1 });
    }

    async fn handle_next(&self, conn: &mut ConnectionState, sequence_number: u64) -> ServerMessage {
        let Some(active) = conn.stream.as_mut() else {
            return ServerError::NoActiveStream.to_message();
        };
        if sequence_number != active.expected {
            let err = ServerError::OutOfOrder {
                expected: active.expected,
                got: sequence_number,
            };
            tracing::warn!("{err}");
            conn.drop_stream();
            return err.to_message();
        }
        active.expected += 1;

        let cancel = conn.cancel.clone();
        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Err(QueryError::Cancelled)),
            item = active.items.next() => item,
        };
        match pulled {
            Some(Ok(item)) => ServerMessage::next_item(sequence_number, item),
            Some(Err(e)) => {
                tracing::warn!("Stream failed at {sequence_number}: {e}");
                conn.drop_stream();
                ServerError::from(e).to_message()
            }
            None => {
                conn.drop_stream();
                ServerMessage::end_of_stream(sequence_number)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_query::{InMemoryExecutor, InMemorySource, NativeType, SourceCatalog, TypeRegistry, Value};

    fn handler() -> ProtocolHandler {
        let registry = Arc::new(TypeRegistry::new());
        let catalog = Arc::new(SourceCatalog::new());
        catalog.add(InMemorySource::shared(
            NativeType::i32(),
            vec![Value::I32(1), Value::I32(2)],
        ));
        ProtocolHandler::new(Arc::new(InMemoryExecutor::new(registry, catalog)))
    }

    fn resource() -> Expression {
        Expression::resource(NativeType::i32().descriptor())
    }

    #[tokio::test]
    async fn test_next_without_stream() {
        let handler = handler();
        let mut conn = ConnectionState::new(CancellationToken::new());
        let reply = handler
            .handle_message(&mut conn, ClientMessage::Next { sequence_number: 1 })
            .await
            .unwrap();
        match reply {
            ServerMessage::Error(e) => assert_eq!(e.code, query_error_codes::NO_ACTIVE_STREAM),
            other => panic!("unexpected {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_stream_sequence_and_end() {
        let handler = handler();
        let mut conn = ConnectionState::new(CancellationToken::new());
        let opened = handler
            .handle_message(&mut conn, ClientMessage::StreamQuery { expression: resource() })
            .await;
        assert!(opened.is_none());

        for seq in 1..=2 {
            let reply = handler.handle_next(&mut conn, seq).await;
            assert!(matches!(reply, ServerMessage::NextResponse { sequence_number, has_next: true, .. } if sequence_number == seq));
        }
        let end = handler.handle_next(&mut conn, 3).await;
        assert!(matches!(end, ServerMessage::NextResponse { has_next: false, item: None, .. }));
        assert!(!conn.has_stream());
    }

    #[tokio::test]
    async fn test_out_of_order_drops_stream() {
        let handler = handler();
        let mut conn = ConnectionState::new(CancellationToken::new());
        handler.open_stream(&mut conn, resource()).await;

        let reply = handler.handle_next(&mut conn, 2).await;
        match reply {
            ServerMessage::Error(e) => assert_eq!(e.code, query_error_codes::OUT_OF_ORDER),
            other => panic!("unexpected {}", other.name()),
        }
        assert!(!conn.has_stream());
    }

    #[tokio::test]
    async fn test_connection_runs_on_a_spawned_task() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let handler = handler();
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let serving = tokio::spawn(async move { handler.serve_connection(server_read, server_write).await });

        let (client_read, mut client_write) = tokio::io::split(client);
        let query = ClientMessage::Query { expression: resource() };
        let line = serde_json::to_string(&query).unwrap();
        client_write.write_all(format!("{line}\n").as_bytes()).await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let reply: ServerMessage = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, ServerMessage::QueryResult { .. }));

        client_write.shutdown().await.unwrap();
        drop(client_write);
        serving.await.unwrap().unwrap();
    }
}
