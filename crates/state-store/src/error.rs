use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when interacting with the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// The stored version did not match the version the writer read.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateStoreError {
    /// Returns true if the error is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateStoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;
