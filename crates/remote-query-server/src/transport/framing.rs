//! Message framing for newline-delimited JSON.
//!
//! Each frame is encoded inside one record reference scope, so a record
//! shared between parts of the same message is written once.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use remote_query::dynamic::with_scope;

use crate::types::{ServerError, ServerResult};

/// Parse a single line of text as a message.
pub fn parse_message<T: DeserializeOwned>(line: &str) -> ServerResult<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ServerError::ParseError("Empty message".to_string()));
    }

    with_scope(|| serde_json::from_str(trimmed)).map_err(|e| ServerError::ParseError(e.to_string()))
}

/// Serialize a message to a JSON line (with trailing newline).
pub fn frame_message<T: Serialize>(msg: &T) -> ServerResult<String> {
    let mut json = with_scope(|| serde_json::to_string(msg)).map_err(ServerError::Json)?;
    json.push('\n');
    Ok(json)
}

/// A line-framed duplex connection over any async reader/writer pair.
pub struct Framed<R, W> {
    reader: BufReader<R>,
    writer: W,
    line: String,
}

impl<R, W> Framed<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        }
    }

    /// Reads the next raw line, skipping blank ones. `None` on EOF.
    pub async fn recv_line(&mut self) -> ServerResult<Option<String>> {
        loop {
            self.line.clear();
            let bytes_read = self.reader.read_line(&mut self.line).await?;
            if bytes_read == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }

    pub async fn recv<T: DeserializeOwned>(&mut self) -> ServerResult<Option<T>> {
        match self.recv_line().await? {
            Some(line) => parse_message(&line).map(Some),
            None => Ok(None),
        }
    }

    /// Writes one frame and flushes it.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> ServerResult<()> {
        let framed = frame_message(msg)?;
        self.writer.write_all(framed.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ServerResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientMessage;

    #[test]
    fn test_empty_line_is_a_parse_error() {
        let err = parse_message::<ClientMessage>("   ").unwrap_err();
        assert!(matches!(err, ServerError::ParseError(_)));
    }

    #[test]
    fn test_frame_ends_with_newline() {
        let framed = frame_message(&ClientMessage::Next { sequence_number: 1 }).unwrap();
        assert!(framed.ends_with('\n'));
        assert_eq!(framed.matches('\n').count(), 1);
    }

    #[tokio::test]
    async fn test_framed_skips_blank_lines() {
        let (mut client, server) = tokio::io::duplex(256);
        let (server_read, _server_write) = tokio::io::split(server);
        client
            .write_all(b"\n\n{\"type\":\"next\",\"sequence_number\":2}\n")
            .await
            .unwrap();
        drop(client);

        let mut framed = Framed::new(server_read, tokio::io::sink());
        let msg: ClientMessage = framed.recv().await.unwrap().unwrap();
        assert!(matches!(msg, ClientMessage::Next { sequence_number: 2 }));
        assert!(framed.recv::<ClientMessage>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_writes_one_flushed_line() {
        let writer = tokio_test::io::Builder::new()
            .write(b"{\"type\":\"next\",\"sequence_number\":7}\n")
            .build();
        let mut framed = Framed::new(tokio::io::empty(), writer);
        framed
            .send(&ClientMessage::Next { sequence_number: 7 })
            .await
            .unwrap();
    }
}
