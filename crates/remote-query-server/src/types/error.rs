//! Error types and wire error codes for the query server.

use serde_json::json;

use remote_query::QueryError;

use super::message::{ErrorObject, ServerMessage};

/// JSON-RPC style codes for framing-level failures.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Codes for query-level failures.
pub mod query_error_codes {
    pub const CANCELLED: i32 = -32800;
    pub const TRANSLATION: i32 = -32850;
    pub const TYPE_RESOLUTION: i32 = -32851;
    pub const MAPPING: i32 = -32852;
    pub const PROTOCOL_DESYNC: i32 = -32853;
    pub const EXECUTION: i32 = -32854;
    pub const EMPTY_OR_OVERSIZED_RESULT: i32 = -32855;
    pub const ALREADY_ENUMERATED: i32 = -32856;

    /// Server: `Next` carried the wrong sequence number.
    pub const OUT_OF_ORDER: i32 = -32860;
    /// Server: `Next` without an open stream.
    pub const NO_ACTIVE_STREAM: i32 = -32861;
    /// Server: dataset could not be loaded.
    pub const SESSION_ERROR: i32 = -32870;
}

/// All errors that can occur in the query server and client.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Out-of-order request: expected sequence number {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("No active stream")]
    NoActiveStream,

    #[error("Session error: {0}")]
    Session(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    pub fn code(&self) -> i32 {
        use error_codes::*;
        use query_error_codes::*;
        match self {
            ServerError::ParseError(_) | ServerError::Json(_) => PARSE_ERROR,
            ServerError::InvalidRequest(_) => INVALID_REQUEST,
            ServerError::OutOfOrder { .. } => OUT_OF_ORDER,
            ServerError::NoActiveStream => NO_ACTIVE_STREAM,
            ServerError::Session(_) => SESSION_ERROR,
            ServerError::Transport(_) | ServerError::Io(_) => INTERNAL_ERROR,
            ServerError::Query(e) => match e {
                QueryError::Translation { .. } => TRANSLATION,
                QueryError::TypeResolution(_) => TYPE_RESOLUTION,
                QueryError::Mapping(_) => MAPPING,
                QueryError::ProtocolDesync(_) => PROTOCOL_DESYNC,
                QueryError::RemoteExecution { .. } | QueryError::Evaluation(_) => EXECUTION,
                QueryError::EmptyOrOversizedResult { .. } => EMPTY_OR_OVERSIZED_RESULT,
                QueryError::AlreadyEnumerated => ALREADY_ENUMERATED,
                QueryError::Cancelled => CANCELLED,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ServerError::Query(e) => e.kind(),
            ServerError::ParseError(_) | ServerError::Json(_) => "parse",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::OutOfOrder { .. } => "out_of_order",
            ServerError::NoActiveStream => "no_active_stream",
            ServerError::Session(_) => "session",
            ServerError::Transport(_) | ServerError::Io(_) => "transport",
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        let mut data = json!({ "kind": self.kind() });
        if let ServerError::Query(QueryError::RemoteExecution { data: Some(inner), .. }) = self {
            data["detail"] = inner.clone();
        }
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: Some(data),
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error(self.to_error_object())
    }
}

/// Client-side view: anything that went wrong below the query layer
/// surfaces as a remote execution failure.
impl From<ServerError> for QueryError {
    fn from(e: ServerError) -> Self {
        match e {
            ServerError::Query(inner) => inner,
            other => QueryError::remote(other.to_string(), Some(json!({ "code": other.code() }))),
        }
    }
}

/// A failure reported by the executing side, kept verbatim.
impl From<ErrorObject> for QueryError {
    fn from(e: ErrorObject) -> Self {
        QueryError::remote(
            e.message,
            Some(json!({ "code": e.code, "data": e.data })),
        )
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_errors_keep_their_category() {
        let err = ServerError::from(QueryError::translation("Sort", "nope"));
        assert_eq!(err.code(), query_error_codes::TRANSLATION);
        let object = err.to_error_object();
        assert_eq!(object.data.unwrap()["kind"], "translation");
        assert_eq!(object.message, "Translation error at Sort: nope");
    }

    #[test]
    fn test_error_object_becomes_remote_execution() {
        let object = ErrorObject {
            code: query_error_codes::EXECUTION,
            message: "boom".into(),
            data: None,
        };
        match QueryError::from(object) {
            QueryError::RemoteExecution { message, data } => {
                assert_eq!(message, "boom");
                assert_eq!(data.unwrap()["code"], query_error_codes::EXECUTION);
            }
            other => panic!("unexpected {other}"),
        }
    }
}
