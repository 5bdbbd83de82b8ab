//! Error taxonomy shared by the translator, mapper, pipeline and protocol.

use std::fmt::Display;

/// Errors that can occur while translating, mapping or executing a query.
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    /// A native or portable node that cannot be mapped in the requested direction.
    #[error("Translation error at {node}: {message}")]
    Translation { node: String, message: String },

    #[error("Type resolution error: {0}")]
    TypeResolution(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Sequence number mismatch, or a pull on a stream that already ended.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// The executing side failed. The payload is passed through uninterpreted.
    #[error("Remote execution error: {message}")]
    RemoteExecution {
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Expected exactly one result element, got {}", describe_count(.count))]
    EmptyOrOversizedResult { count: usize },

    /// The backend failed while evaluating a native tree.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Sequence was already enumerated")]
    AlreadyEnumerated,

    #[error("Operation cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn translation(node: impl Display, message: impl Into<String>) -> Self {
        QueryError::Translation {
            node: node.to_string(),
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        QueryError::RemoteExecution {
            message: message.into(),
            data,
        }
    }

    /// Short machine-readable category name, used in wire error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Translation { .. } => "translation",
            QueryError::TypeResolution(_) => "type_resolution",
            QueryError::Mapping(_) => "mapping",
            QueryError::ProtocolDesync(_) => "protocol_desync",
            QueryError::RemoteExecution { .. } => "remote_execution",
            QueryError::EmptyOrOversizedResult { .. } => "empty_or_oversized_result",
            QueryError::Evaluation(_) => "evaluation",
            QueryError::AlreadyEnumerated => "already_enumerated",
            QueryError::Cancelled => "cancelled",
        }
    }
}

fn describe_count(count: &usize) -> &'static str {
    match *count {
        0 => "none",
        _ => "more than one",
    }
}

/// Convenience result type.
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_result_message() {
        let err = QueryError::EmptyOrOversizedResult { count: 0 };
        assert_eq!(err.to_string(), "Expected exactly one result element, got none");
        let err = QueryError::EmptyOrOversizedResult { count: 2 };
        assert!(err.to_string().ends_with("more than one"));
    }

    #[test]
    fn test_translation_names_node() {
        let err = QueryError::translation("Sort", "not valid here");
        assert_eq!(err.to_string(), "Translation error at Sort: not valid here");
        assert_eq!(err.kind(), "translation");
    }
}
