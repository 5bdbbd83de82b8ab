//! TCP transport: every accepted connection gets its own task.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::protocol::ProtocolHandler;
use crate::types::{ServerError, ServerResult};

pub struct SocketTransport {
    handler: ProtocolHandler,
}

impl SocketTransport {
    pub fn new(handler: ProtocolHandler) -> Self {
        Self { handler }
    }

    /// Bind `addr` and serve until ctrl-c.
    pub async fn run(&self, addr: &str) -> ServerResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("Failed to bind {addr}: {e}")))?;
        let shutdown = self.handler.shutdown_token();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                signal.cancel();
            }
        });
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> ServerResult<()> {
        if let Ok(local) = listener.local_addr() {
            tracing::info!("Listening on {local}");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            tracing::info!("Connection from {peer}");

            let handler = self.handler.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                match handler.serve_connection(reader, writer).await {
                    Ok(()) => tracing::info!("Connection from {peer} closed"),
                    Err(e) => tracing::warn!("Connection from {peer} failed: {e}"),
                }
            });
        }

        tracing::info!("Socket transport stopped");
        Ok(())
    }
}
