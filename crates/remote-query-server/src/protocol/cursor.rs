//! Querying side of the streaming protocol.
//!
//! A [`StreamCursor`] connects on its first pull, sends the query, then
//! requests elements one `Next` at a time. Each response must echo the
//! sequence number just sent; anything else ends the cursor.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use remote_query::{DynamicValue, Expression, QueryError, QueryResult};

use crate::transport::framing::Framed;
use crate::types::*;

/// A duplex message channel to an executing peer.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, msg: &ClientMessage) -> ServerResult<()>;

    /// Next message from the peer. `None` once the peer has hung up.
    async fn recv(&mut self) -> ServerResult<Option<ServerMessage>>;

    async fn close(&mut self) -> ServerResult<()>;
}

#[async_trait]
impl<R, W> Connection for Framed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &ClientMessage) -> ServerResult<()> {
        Framed::send(self, msg).await
    }

    async fn recv(&mut self) -> ServerResult<Option<ServerMessage>> {
        Framed::recv(self).await
    }

    async fn close(&mut self) -> ServerResult<()> {
        self.shutdown().await
    }
}

/// Opens connections for cursors and clients.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> ServerResult<Box<dyn Connection>>;

    /// Called exactly once per cursor or request when it is done with the
    /// peer, whether or not it ever connected.
    fn release(&self) {}
}

/// Connects over TCP to a running server.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> ServerResult<Box<dyn Connection>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| ServerError::Transport(format!("Failed to connect to {}: {e}", self.addr)))?;
        tracing::debug!("Connected to {}", self.addr);
        let (reader, writer) = stream.into_split();
        Ok(Box::new(Framed::new(reader, writer)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing sent yet.
    Unstarted,
    AwaitingNext,
    Exhausted,
    Errored,
    Disposed,
}

/// Lazily-started, pull-based enumeration of a remote stream.
pub struct StreamCursor {
    connector: Arc<dyn Connector>,
    expression: Expression,
    conn: Option<Box<dyn Connection>>,
    state: CursorState,
    sequence_number: u64,
    cancel: CancellationToken,
    released: bool,
}

impl StreamCursor {
    pub fn new(connector: Arc<dyn Connector>, expression: Expression) -> Self {
        Self {
            connector,
            expression,
            conn: None,
            state: CursorState::Unstarted,
            sequence_number: 0,
            cancel: CancellationToken::new(),
            released: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Sequence number of the last `Next` sent.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state,
            CursorState::Exhausted | CursorState::Errored | CursorState::Disposed
        )
    }

    /// Pull the next element. `Ok(None)` marks the end of the stream.
    pub async fn next(&mut self) -> QueryResult<Option<DynamicValue>> {
        match self.state {
            CursorState::Exhausted => {
                return Err(QueryError::ProtocolDesync("stream already ended".into()))
            }
            CursorState::Errored => return Err(QueryError::ProtocolDesync("stream already failed".into())),
            CursorState::Disposed => return Err(QueryError::ProtocolDesync("cursor is disposed".into())),
            CursorState::Unstarted | CursorState::AwaitingNext => {}
        }

        match self.advance().await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                self.state = CursorState::Exhausted;
                self.teardown();
                Ok(None)
            }
            Err(e) => {
                tracing::debug!("Cursor failed at {}: {e}", self.sequence_number);
                self.state = CursorState::Errored;
                self.teardown();
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> QueryResult<Option<DynamicValue>> {
        if self.cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        if self.conn.is_none() {
            let mut conn = self.connector.connect().await?;
            if self.cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            conn.send(&ClientMessage::StreamQuery {
                expression: self.expression.clone(),
            })
            .await?;
            self.conn = Some(conn);
            self.state = CursorState::AwaitingNext;
        }

        if self.cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        self.sequence_number += 1;
        let seq = self.sequence_number;
        let cancel = self.cancel.clone();
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| QueryError::ProtocolDesync("connection lost".into()))?;
        conn.send(&ClientMessage::Next { sequence_number: seq }).await?;

        // Cancelling here leaves a response in flight; the connection is
        // discarded by the caller.
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            reply = conn.recv() => reply?,
        };

        match reply {
            Some(ServerMessage::NextResponse {
                sequence_number,
                has_next,
                item,
            }) => {
                if sequence_number != seq {
                    return Err(QueryError::ProtocolDesync(format!(
                        "expected response {seq}, got {sequence_number}"
                    )));
                }
                if !has_next {
                    return Ok(None);
                }
                item.map(Some)
                    .ok_or_else(|| QueryError::ProtocolDesync(format!("response {seq} carries no item")))
            }
            Some(ServerMessage::Error(e)) => Err(e.into()),
            Some(other) => Err(QueryError::ProtocolDesync(format!(
                "unexpected {} while streaming",
                other.name()
            ))),
            None => Err(QueryError::ProtocolDesync(format!(
                "connection closed before response {seq}"
            ))),
        }
    }

    fn teardown(&mut self) {
        self.conn = None;
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.connector.release();
        }
    }

    /// Close the cursor. Safe to call more than once.
    pub async fn dispose(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!("Close failed: {e}");
            }
        }
        if !self.is_closed() {
            self.state = CursorState::Disposed;
        }
        self.release();
    }

    /// Drain the cursor as a stream. The stream ends after the first error.
    pub fn into_stream(self) -> BoxStream<'static, QueryResult<DynamicValue>> {
        stream::unfold(self, |mut cursor| async move {
            if cursor.is_closed() {
                return None;
            }
            match cursor.next().await {
                Ok(Some(item)) => Some((Ok(item), cursor)),
                Ok(None) => None,
                Err(e) => Some((Err(e), cursor)),
            }
        })
        .boxed()
    }
}

impl Drop for StreamCursor {
    fn drop(&mut self) {
        self.release();
    }
}
