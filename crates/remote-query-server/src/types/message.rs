//! Wire messages of the sequenced streaming protocol.
//!
//! Every message is one JSON document per line, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use remote_query::{DynamicValue, Expression};

/// Protocol revision reported by `info`.
pub const PROTOCOL_VERSION: &str = "1";

/// Messages sent by the querying side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens a stream. Elements are then pulled one `Next` at a time.
    StreamQuery { expression: Expression },
    /// Runs a query and answers with one `QueryResult`.
    Query { expression: Expression },
    Next { sequence_number: u64 },
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::StreamQuery { .. } => "stream_query",
            ClientMessage::Query { .. } => "query",
            ClientMessage::Next { .. } => "next",
        }
    }
}

/// Messages sent by the executing side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    NextResponse {
        sequence_number: u64,
        has_next: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item: Option<DynamicValue>,
    },
    QueryResult {
        result: DynamicValue,
    },
    Error(ErrorObject),
}

impl ServerMessage {
    pub fn next_item(sequence_number: u64, item: DynamicValue) -> Self {
        ServerMessage::NextResponse {
            sequence_number,
            has_next: true,
            item: Some(item),
        }
    }

    pub fn end_of_stream(sequence_number: u64) -> Self {
        ServerMessage::NextResponse {
            sequence_number,
            has_next: false,
            item: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::NextResponse { .. } => "next_response",
            ServerMessage::QueryResult { .. } => "query_result",
            ServerMessage::Error(_) => "error",
        }
    }
}

/// Failure report. `data` carries the error category and any detail the
/// executing side chose to attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_is_tagged() {
        let msg = ClientMessage::Next { sequence_number: 3 };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "next", "sequence_number": 3})
        );
    }

    #[test]
    fn test_end_of_stream_omits_item() {
        let value = serde_json::to_value(ServerMessage::end_of_stream(4)).unwrap();
        assert_eq!(
            value,
            json!({"type": "next_response", "sequence_number": 4, "has_next": false})
        );
    }

    #[test]
    fn test_error_flattens_object() {
        let msg: ServerMessage =
            serde_json::from_value(json!({"type": "error", "code": -32600, "message": "bad"})).unwrap();
        match msg {
            ServerMessage::Error(e) => {
                assert_eq!(e.code, -32600);
                assert!(e.data.is_none());
            }
            other => panic!("unexpected {}", other.name()),
        }
    }
}
