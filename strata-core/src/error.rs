//! Error types for strata.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.
//! Each variant belongs to one [`ErrorKind`] so an outer API layer can map
//! failures to transport status codes without inspecting messages.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Coarse classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Invalid,
    Upstream,
    Internal,
}

/// Main error type for strata.
#[derive(Error, Debug)]
pub enum StrataError {
    // Lookup errors
    #[error("Account not found: {account}")]
    AccountNotFound { account: String },

    #[error("Stack not found: {account}/{stack_id}")]
    StackNotFound { account: String, stack_id: String },

    #[error("Service not found: {key}")]
    ServiceNotFound { key: String },

    #[error("Stack service not found: {stack_service_id}")]
    StackServiceNotFound { stack_service_id: String },

    #[error("Vocabulary not found: {name}")]
    VocabularyNotFound { name: String },

    // Conflicts
    #[error("Account already exists: {account}")]
    AccountExists { account: String },

    #[error("Service already exists with key: {key}")]
    ServiceExists { key: String },

    #[error("Stack {stack_id} is {status}, expected {expected}")]
    InvalidStackState { stack_id: String, status: String, expected: String },

    #[error("Two volume mounts cannot refer to the same container path: {container_path}")]
    VolumeMountConflict { container_path: String },

    #[error("Service {key} is required by another service")]
    ServiceRequired { key: String },

    #[error("Service {key} is in use by {count} stack service(s)")]
    ServiceInUse { key: String, count: usize },

    #[error("Concurrent modification of {key}, giving up after {attempts} attempts")]
    WriteConflict { key: String, attempts: usize },

    // Authorization
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    // Validation
    #[error("Circular dependency detected in service: {service}")]
    CircularDependency { service: String },

    #[error("Configuration variable {name} of service {key} cannot be overridden")]
    NotOverridable { key: String, name: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Upstream collaborators
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    #[error("Cluster operation {operation} failed: {reason}")]
    ClusterError { operation: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Create a cluster driver error for `operation`.
    pub fn cluster(operation: &str, reason: impl std::fmt::Display) -> Self {
        Self::ClusterError { operation: operation.to_string(), reason: reason.to_string() }
    }

    /// Create an authorization error.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized { reason: reason.into() }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccountNotFound { .. }
            | Self::StackNotFound { .. }
            | Self::ServiceNotFound { .. }
            | Self::StackServiceNotFound { .. }
            | Self::VocabularyNotFound { .. } => ErrorKind::NotFound,
            Self::AccountExists { .. }
            | Self::ServiceExists { .. }
            | Self::InvalidStackState { .. }
            | Self::VolumeMountConflict { .. }
            | Self::ServiceRequired { .. }
            | Self::ServiceInUse { .. }
            | Self::WriteConflict { .. } => ErrorKind::Conflict,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::CircularDependency { .. }
            | Self::NotOverridable { .. }
            | Self::InvalidRequest { .. }
            | Self::InvalidConfig { .. } => ErrorKind::Invalid,
            Self::DatabaseError(_)
            | Self::MigrationFailed { .. }
            | Self::ClusterError { .. }
            | Self::IoError { .. } => ErrorKind::Upstream,
            Self::Internal(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Convenience check used by lookups that tolerate absence.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
