use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use eventsync_core::errors::{DatabaseError, Error};

/// Failures raised inside the storage crate before they cross into the engine.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Query failed: {0}")]
    Query(#[from] DieselError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Could not open database: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine error raised by a writer job; rolls the transaction back.
    #[error(transparent)]
    Domain(Error),
}

impl StorageError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Self::Query(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))
        )
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Domain(inner) => inner,
            StorageError::Query(DieselError::NotFound) => {
                Error::not_found("Requested ledger row does not exist")
            }
            StorageError::Query(e) => Error::Database(DatabaseError::Query(e.to_string())),
            StorageError::Pool(e) => Error::Database(DatabaseError::Pool(e.to_string())),
            StorageError::Connection(e) => Error::Database(DatabaseError::Pool(e.to_string())),
            StorageError::Migration(msg) => Error::Database(DatabaseError::Migration(msg)),
            StorageError::Io(e) => Error::Database(DatabaseError::Internal(e.to_string())),
        }
    }
}
