//! Error types for the repository engine
//!
//! Every failure raised by the repository, the unit of work or a store adapter
//! is a [`RepoError`]. Errors are raised synchronously from the operation that
//! detects them and are never retried internally.
//!
//! # Error Categories
//!
//! - **NotFound**: keyed lookup or save-time re-check found no row
//! - **Configuration**: missing or inconsistent type metadata, unresolved tenant,
//!   unsupported mask shape
//! - **InvariantViolation**: an established nested reference would be cleared or
//!   re-pointed, or a cascade was requested for an unknown origin operation
//! - **ConcurrencyConflict**: the store rejected a write because the row changed
//! - **InvalidData**: the incoming item of an update is unusable
//!
//! # Examples
//!
//! ```rust
//! use recordgraph::errors::RepoError;
//!
//! let err = RepoError::not_found("customer", "42");
//! assert!(err.is_not_found());
//! assert_eq!(err.error_code(), "NOT_FOUND");
//! ```

use thiserror::Error;

/// Repository engine errors
#[derive(Error, Debug)]
pub enum RepoError {
    /// No row exists for the requested key
    #[error("{entity} '{key}' not found")]
    NotFound {
        /// Entity type name
        entity: String,
        /// Storage form of the key
        key: String,
    },

    /// Type metadata, tenant scope or mask shape is not usable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A structural rule of the object graph would be broken
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The store saw a conflicting concurrent write
    #[error("Concurrency conflict on {entity} '{key}'")]
    ConcurrencyConflict {
        /// Entity type name
        entity: String,
        /// Storage form of the key
        key: String,
    },

    /// The incoming data cannot be applied
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Stored document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be read or parsed
    #[error("Config error: {0}")]
    Config(String),
}

impl RepoError {
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        RepoError::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        RepoError::Configuration(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        RepoError::InvariantViolation(message.into())
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        RepoError::InvalidData(message.into())
    }

    pub fn conflict(entity: impl Into<String>, key: impl Into<String>) -> Self {
        RepoError::ConcurrencyConflict {
            entity: entity.into(),
            key: key.into(),
        }
    }

    /// Check if this is a not found error (404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound { .. })
    }

    /// Check if this is a concurrency conflict (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::ConcurrencyConflict { .. })
    }

    /// Check if this is a client error (400-series)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RepoError::NotFound { .. }
                | RepoError::InvariantViolation(_)
                | RepoError::ConcurrencyConflict { .. }
                | RepoError::InvalidData(_)
        )
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RepoError::NotFound { .. } => "NOT_FOUND",
            RepoError::Configuration(_) => "CONFIGURATION_ERROR",
            RepoError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            RepoError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            RepoError::InvalidData(_) => "INVALID_DATA",
            RepoError::Database(_) => "DATABASE_ERROR",
            RepoError::Serialization(_) => "SERIALIZATION_ERROR",
            RepoError::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Result type alias for repository operations
pub type RepoResult<T> = Result<T, RepoError>;
