//! Storage error types.
//!
//! Defines errors that can occur in the local persistence layer:
//! - `InvalidPath`: subdir or file name cannot be stored
//! - `Serialization`: Failed to encode/decode data
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Subdir or file name is empty or contains a reserved character
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
