//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur while reading or writing engine state.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored data failed a consistency check
    #[error("corrupted store data: {0}")]
    Corrupted(String),

    /// Backend cannot serve requests (poisoned lock, injected failure)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Record addressed by id does not exist
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
