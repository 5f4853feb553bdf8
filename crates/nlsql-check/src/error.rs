//! Error types for nlsql-check.

use thiserror::Error;

/// Result type for nlsql-check operations.
pub type CheckResult<T> = Result<T, CheckError>;

/// Error type for nlsql-check operations.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("decode error for column '{column}': {message}")]
    Decode { column: String, message: String },
}

impl CheckError {
    /// Create a decode error.
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        CheckError::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CheckError::Validation(message.into())
    }
}
