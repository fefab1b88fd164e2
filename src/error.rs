//! Error types for the content store.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Access to a field outside a record kind's schema.
    #[error("Unknown field '{field}' for {kind}")]
    UnknownField { kind: &'static str, field: String },

    #[error("Missing required field '{field}' for {kind}")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("Invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("Timed out waiting for lock on {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("Unsupported source: {0:?}")]
    UnsupportedSource(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for StoreError {
    fn from(e: base64::DecodeError) -> Self {
        StoreError::Encoding(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
