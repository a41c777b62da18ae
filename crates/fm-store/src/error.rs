// error.rs — Error types for the record store.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize/deserialize record data.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// No record exists for the given project id.
    #[error("project not found: {id}")]
    NotFound { id: String },

    /// A record already exists for the given project id.
    #[error("project already exists: {id}")]
    AlreadyExists { id: String },

    /// The record on disk failed checksum or structural validation.
    /// Likely a truncated write or a concurrent writer mid-flight.
    #[error("corrupt record for project {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// The on-disk version no longer matches the version the caller
    /// read — another writer got there first.
    #[error("version conflict on project {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
}
