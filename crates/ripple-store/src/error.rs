//! Error types for the storage layer.

use ripple_types::QueryError;
use thiserror::Error;

use crate::sqlite::MigrationError;

/// Errors raised by storage adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The adapter was used before `start()` or after `stop()`.
    #[error("storage adapter not started")]
    NotStarted,

    /// A filter, update, or projection could not be evaluated.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// An insert reused an identity already present in the collection.
    #[error("duplicate id {id} in collection {collection}")]
    DuplicateId { collection: String, id: String },

    /// Collection names must be non-empty.
    #[error("Collection name must be a non-empty string")]
    InvalidCollection,

    /// No registered adapter accepts the connector string.
    #[error("no storage adapter registered for connector '{0}'")]
    UnsupportedConnector(String),

    /// A SQLite statement failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Schema migrations failed during `start()`.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// A stored body could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking storage task panicked or was cancelled.
    #[error("storage task failed: {0}")]
    Task(String),
}
