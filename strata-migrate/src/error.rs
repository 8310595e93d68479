//! Error types for the migration engine.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Bad input, such as a malformed model snapshot or an unsatisfied dependency.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Migration already applied, or an id already taken.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Migration (or ledger entry) not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Introspection or statement execution failure.
    #[error("Database error: {0}")]
    Database(String),

    /// One or more applied migrations no longer match their stored artifacts.
    #[error("Integrity check failed for migrations: {}", .ids.join(", "))]
    Integrity {
        /// Offending migration ids.
        ids: Vec<String>,
    },

    /// Artifact store I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or snapshot could not be read.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No changes to migrate.
    #[error("No schema changes detected")]
    NoChanges,

    /// The operation was cancelled before it started.
    #[error("Operation cancelled")]
    Cancelled,

    /// Anything else.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl MigrationError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a conflict error for an already-applied migration.
    pub fn already_applied(id: &str) -> Self {
        Self::Conflict(format!("migration '{}' has already been applied", id))
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unexpected error.
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Check if this is a recoverable error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NoChanges | Self::Cancelled)
    }
}
