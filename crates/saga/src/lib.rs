//! Saga orchestration for user registration.
//!
//! A registration spans three services and runs as a saga of three steps:
//! 1. `CREATE_USER` (undone by `DELETE_USER`)
//! 2. `SETUP_ALERTS` (undone by `DISABLE_ALERTS`)
//! 3. `SEND_WELCOME_NOTIFICATION` (undone by `SEND_FAILURE_NOTIFICATION`)
//!
//! The [`SagaOrchestrator`] starts sagas and applies result events consumed
//! from the partitioned `saga-events` channel. The [`RetryManager`] retries
//! failed step hand-offs with exponential backoff and the [`TimeoutManager`]
//! fails sagas and steps that stall. All three read-modify-write the saga
//! state under a per-saga lock; on failure they publish a
//! `SAGA_COMPENSATION` event for the last completed step.

pub mod channel;
pub mod consumer;
pub mod context;
mod dispatch;
pub mod error;
pub mod events;
pub mod locks;
pub mod model;
pub mod orchestrator;
pub mod registration;
pub mod repository;
pub mod retry;
pub mod services;
pub mod state;
pub mod timeout;

pub use channel::{ChannelError, EventChannel, InMemoryEventChannel, Message, SAGA_TOPIC};
pub use consumer::{process_message, spawn_consumers};
pub use context::SagaContext;
pub use error::{Result, SagaError};
pub use events::{DecodeError, EventKind, EventPayload, SagaEvent};
pub use locks::SagaLocks;
pub use model::{SagaState, SagaStep};
pub use orchestrator::{EventOutcome, IgnoreReason, SagaOrchestrator};
pub use repository::SagaRepository;
pub use retry::{
    MAX_RETRY_ATTEMPTS, RETRY_BASE_DELAY, RetryHandle, RetryManager, RetryOutcome, StepAction,
    step_action,
};
pub use services::{InMemoryStepTrigger, LoggingStepTrigger, StepRequest, StepTrigger};
pub use state::{SagaStatus, StepStatus};
pub use timeout::{
    SAGA_TIMEOUT, STEP_TIMEOUT, SWEEP_INTERVAL, SweepReport, TimeoutManager, TimeoutOutcome,
};
