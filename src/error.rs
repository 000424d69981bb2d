//! Store error types.

use thiserror::Error;

/// Face record store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed or missing input. Detected before any write begins.
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced user or analysis does not exist.
    #[error("reference error: {0}")]
    Reference(String),

    /// A destructive operation was attempted without confirmation.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The database file is unreadable or its schema is not one we know.
    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
                StoreError::Corruption(err.to_string())
            }
            Some(ErrorCode::CannotOpen) | Some(ErrorCode::ReadOnly) | Some(ErrorCode::DiskFull) => {
                StoreError::Io(std::io::Error::other(err.to_string()))
            }
            _ => StoreError::Database(err),
        }
    }
}

impl From<csv::Error> for StoreError {
    fn from(err: csv::Error) -> Self {
        StoreError::Io(err.into())
    }
}

impl From<tempfile::PersistError> for StoreError {
    fn from(err: tempfile::PersistError) -> Self {
        StoreError::Io(err.error)
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
