//! Error types for trackhub.
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for trackhub operations
pub type HubResult<T> = Result<T, HubError>;

/// Main error type for trackhub operations
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

impl HubError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        HubError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new sync error
    pub fn sync(message: impl Into<String>) -> Self {
        HubError::Sync(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        HubError::Config(message.into())
    }

    /// True when the underlying SQLite error is a constraint violation
    /// (duplicate primary key, unique index, CHECK).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            HubError::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
