//! Sync engine error types.

use thiserror::Error;
use xavyo_metaverse::MetaverseError;

/// Errors that can occur during a synchronization run.
///
/// Expected per-object outcomes (ambiguous match, existing join, unresolved
/// reference) are not errors; they are recorded on execution items.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Storage backend error that is not a database driver error.
    #[error("Repository error: {message}")]
    Repository { message: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A schema the run depends on is missing.
    #[error("Missing schema: {entity} {id}")]
    MissingSchema { entity: String, id: String },

    /// A sync rule does not match its schemas.
    #[error("Malformed sync rule: {0}")]
    MalformedSyncRule(#[from] MetaverseError),

    /// Attribute mapping expression failed.
    #[error("Expression error in '{expression}': {message}")]
    Expression { expression: String, message: String },

    /// Not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The run was cancelled.
    #[error("Synchronization run was cancelled")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Create a repository error.
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a missing schema error.
    pub fn missing_schema(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::MissingSchema {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create an expression error.
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error aborts the whole run rather than a single object.
    #[must_use]
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            SyncError::Database(_)
                | SyncError::Repository { .. }
                | SyncError::Configuration { .. }
                | SyncError::MissingSchema { .. }
                | SyncError::MalformedSyncRule(_)
                | SyncError::Cancelled
        )
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
