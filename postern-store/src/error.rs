//! Error types for the postern-store crate.

use std::io;

use thiserror::Error;

use crate::MailId;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (file read/write/rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// The record has never been saved, or has been removed underneath us.
    #[error("Mail not found: {0}")]
    NotFound(MailId),

    /// Someone else saved the record since it was loaded.
    #[error("Mail {id} was modified concurrently (expected version {expected}, found {found})")]
    Conflict {
        id: MailId,
        expected: u64,
        found: u64,
    },

    /// Store location validation failed.
    #[error("Store validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns `true` if the save lost an optimistic-locking race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored document does not describe a valid record.
    #[error("Invalid record format: {0}")]
    InvalidFormat(String),
}

/// Store location validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Path is not absolute.
    #[error("Store path must be absolute: {0}")]
    NotAbsolute(String),

    /// Path contains `..`.
    #[error("Store path cannot contain '..' components: {0}")]
    ParentDirectory(String),

    /// Path points into a system directory.
    #[error("Store path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    /// Path exists but is not a directory.
    #[error("Store path is not a directory: {0}")]
    NotDirectory(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(SerializationError::Json(e))
    }
}
