//! Errors from the Postgres layer.

use capsched_capacity::CapacityError;
use capsched_id::IdError;
use thiserror::Error;

/// Failures of the store. Core refusals pass through as [`DbError::Capacity`].
#[derive(Debug, Error)]
pub enum DbError {
    #[error("cannot reach postgres: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("capacity query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("applying capacity schema failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// None of the candidate directories held a readable migration set.
    #[error("no migrations found (tried {tried}; last error: {last_error})")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A stored id does not parse.
    #[error("invalid stored id: {0}")]
    InvalidId(#[from] IdError),

    /// A stored value is out of range for its domain type.
    #[error("invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    /// The capacity core refused the operation.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// A JSONB VM definition does not decode.
    #[error("bad vm definition: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// The core error behind this one, if any.
    pub fn capacity(&self) -> Option<&CapacityError> {
        match self {
            Self::Capacity(e) => Some(e),
            _ => None,
        }
    }
}
