//! Error types for nodemesh

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Operation error codes surfaced to callers and to the coordinating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AlreadyACluster,
    OperationNotSupported,
    DatastoreExists,
    DatastoreNotFound,
    CollectionExists,
    CollectionNotFound,
    InvalidArgument,
    NotAMember,
    InternalOperationError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::AlreadyACluster => "ALREADY_A_CLUSTER",
            ErrorCode::OperationNotSupported => "OPERATION_NOT_SUPPORTED",
            ErrorCode::DatastoreExists => "DATASTORE_EXISTS",
            ErrorCode::DatastoreNotFound => "DATASTORE_NOT_FOUND",
            ErrorCode::CollectionExists => "COLLECTION_EXISTS",
            ErrorCode::CollectionNotFound => "COLLECTION_NOT_FOUND",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotAMember => "NOT_A_MEMBER",
            ErrorCode::InternalOperationError => "INTERNAL_OPERATION_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Connection Errors ===
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No live connection to node {0}")]
    NotConnected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Operation Errors ===
    #[error("{code}: {message}")]
    Operation { code: ErrorCode, message: String },

    // === Cluster Errors ===
    #[error("Onboarding of {node} failed at {phase}: {cause}")]
    OnboardingFailed {
        node: String,
        phase: String,
        cause: String,
    },

    #[error("Transaction {request_id} aborted: {cause}")]
    TransactionAborted { request_id: String, cause: String },

    // === Persistence Errors ===
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a typed operational failure.
    pub fn operation(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Operation {
            code,
            message: message.into(),
        }
    }

    /// Error code carried by an operational failure, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Operation { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::NotConnected(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_display() {
        let err = Error::operation(ErrorCode::AlreadyACluster, "node is already a cluster member");
        assert_eq!(err.code(), Some(ErrorCode::AlreadyACluster));
        assert_eq!(
            err.to_string(),
            "ALREADY_A_CLUSTER: node is already a cluster member"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("ack".into()).is_retryable());
        assert!(Error::NotConnected("n1".into()).is_retryable());
        assert!(!Error::operation(ErrorCode::InvalidArgument, "x").is_retryable());
    }
}
