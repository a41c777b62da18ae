// error.rs — Error types for the lock coordinator.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while coordinating locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be acquired within the caller's timeout.
    #[error("timed out acquiring lock on {id} after {waited_ms} ms")]
    Timeout { id: String, waited_ms: u128 },

    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to serialize/deserialize a lock record.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
