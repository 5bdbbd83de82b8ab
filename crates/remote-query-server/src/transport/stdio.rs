//! Stdio transport: a single connection over stdin/stdout.

use crate::protocol::ProtocolHandler;
use crate::types::ServerResult;

pub struct StdioTransport {
    handler: ProtocolHandler,
}

impl StdioTransport {
    pub fn new(handler: ProtocolHandler) -> Self {
        Self { handler }
    }

    /// Serve until stdin reaches EOF.
    pub async fn run(&self) -> ServerResult<()> {
        tracing::info!("Stdio transport started");
        self.handler
            .serve_connection(tokio::io::stdin(), tokio::io::stdout())
            .await?;
        tracing::info!("EOF on stdin, shutting down");
        Ok(())
    }
}
