//! Saga error types.

use common::SagaId;
use state_store::StateStoreError;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::events::DecodeError;

/// Errors that can occur during saga operations.
///
/// Only [`SagaError::StepExecution`] is transient; the retry manager absorbs
/// it until attempts run out. Everything else is reported to the caller, who
/// decides whether to log and drop or escalate.
#[derive(Debug, Error)]
pub enum SagaError {
    /// An event referenced a saga that is not in the store.
    #[error("Unknown saga: {0}")]
    UnknownSaga(SagaId),

    /// A freshly generated saga id already exists in the store.
    #[error("Saga {0} already exists")]
    DuplicateSaga(SagaId),

    /// A step's remote action failed and may be retried.
    #[error("Step '{step}' failed: {reason}")]
    StepExecution { step: String, reason: String },

    /// A step's remote action failed permanently.
    #[error("Step '{step}' failed after {attempts} attempts")]
    StepExhausted { step: String, attempts: u32 },

    /// A saga or step deadline passed.
    #[error("Deadline exceeded for saga {saga_id}: {scope}")]
    DeadlineExceeded { saga_id: SagaId, scope: String },

    /// The state store could not be read or written.
    ///
    /// The decision that caused the write has still been carried out, so the
    /// durable copy may now lag behind.
    #[error("Persistence failure for saga {saga_id}: {source}")]
    Persistence {
        saga_id: SagaId,
        #[source]
        source: StateStoreError,
    },

    /// A status change that would move a saga or step backwards.
    #[error("Invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    /// The saga has no step with the given name.
    #[error("Saga {saga_id} has no step '{step}'")]
    StepNotFound { saga_id: SagaId, step: String },

    /// The event channel rejected a message.
    #[error("Event channel error: {0}")]
    Channel(#[from] ChannelError),

    /// An inbound message could not be turned into an event.
    #[error("Event decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the failure is eligible for retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SagaError::StepExecution { .. })
    }

    /// Returns true if the error points at a broken deployment rather than a
    /// bad message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SagaError::DuplicateSaga(_))
    }

    /// Returns true if the durable copy of the saga may have diverged.
    pub fn is_persistence(&self) -> bool {
        matches!(self, SagaError::Persistence { .. })
    }

    /// Creates a transient step failure.
    pub fn step_execution(step: impl Into<String>, reason: impl Into<String>) -> Self {
        SagaError::StepExecution {
            step: step.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn persistence(saga_id: SagaId, source: StateStoreError) -> Self {
        SagaError::Persistence { saga_id, source }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
