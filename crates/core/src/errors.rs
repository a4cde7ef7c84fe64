//! Error types shared by the synchronization engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification persisted with failed operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    Connection,
    Validation,
    ConflictInFlight,
    LinkIntegrity,
    Configuration,
    NotFound,
    Database,
    Serialization,
    Cancelled,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Validation => "validation",
            Self::ConflictInFlight => "conflict_in_flight",
            Self::LinkIntegrity => "link_integrity",
            Self::Configuration => "configuration",
            Self::NotFound => "not_found",
            Self::Database => "database",
            Self::Serialization => "serialization",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage-level failures reported by ledger implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Internal storage error: {0}")]
    Internal(String),
}

/// Errors produced while reconciling records.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient network or timeout failure against a collaborator.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or type-mismatched payload or patch.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another resolution of the same conflict is running.
    #[error("Conflict {conflict_id} is already being resolved")]
    ConflictInFlight { conflict_id: String },

    /// A link would stop being one-to-one.
    #[error("Link integrity violation: {0}")]
    LinkIntegrity(String),

    /// Invalid or unusable configuration (bad endpoint, rejected credentials).
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn link_integrity(message: impl Into<String>) -> Self {
        Self::LinkIntegrity(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Connection(_) => SyncErrorKind::Connection,
            Self::Validation(_) => SyncErrorKind::Validation,
            Self::ConflictInFlight { .. } => SyncErrorKind::ConflictInFlight,
            Self::LinkIntegrity(_) => SyncErrorKind::LinkIntegrity,
            Self::Configuration(_) => SyncErrorKind::Configuration,
            Self::NotFound(_) => SyncErrorKind::NotFound,
            Self::Database(_) => SyncErrorKind::Database,
            Self::Serialization(_) => SyncErrorKind::Serialization,
            Self::Cancelled => SyncErrorKind::Cancelled,
        }
    }

    /// Only transient connection failures are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
