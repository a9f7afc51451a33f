//! The saga state machine: starts registrations and routes result events to
//! step transitions.

use std::collections::HashMap;
use std::sync::Arc;

use common::SagaId;
use state_store::StateStore;

use crate::context::SagaContext;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SagaError};
use crate::events::{EventKind, SagaEvent};
use crate::model::SagaState;
use crate::registration;
use crate::retry::RetryManager;
use crate::services::StepTrigger;
use crate::state::{SagaStatus, StepStatus};

/// Why an event changed nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The saga already finished.
    TerminalState(SagaStatus),
    /// The step already has the reported result.
    Duplicate,
    /// The step is not the one executing.
    OutOfOrder,
    /// The saga failed and waits for its compensation acknowledgment.
    CompensationPending,
}

/// What handling an event did to its saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A step completed and the next one started.
    Advanced {
        completed_step: String,
        next_step: String,
    },
    /// The last step completed; the saga is `COMPLETED`.
    Completed,
    /// A step failed; the saga is `FAILED`. `compensated_step` is `None`
    /// when nothing had completed and no compensation event was sent.
    CompensationTriggered {
        failed_step: String,
        compensated_step: Option<String>,
    },
    /// The compensation was acknowledged; the saga is `COMPENSATED`.
    Compensated,
    /// Nothing changed.
    Ignored(IgnoreReason),
}

/// Drives user registration sagas.
///
/// Every mutation loads the saga under its lock, applies one transition,
/// writes it back and only then talks to collaborators. Step hand-offs run
/// in background tasks so a slow service never holds up event handling.
pub struct SagaOrchestrator<S> {
    ctx: Arc<SagaContext<S>>,
    dispatcher: Dispatcher<S>,
    retry: RetryManager<S>,
}

impl<S: StateStore + 'static> SagaOrchestrator<S> {
    pub fn new(ctx: Arc<SagaContext<S>>, trigger: Arc<dyn StepTrigger>) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&ctx), Arc::clone(&trigger));
        let retry = RetryManager::new(Arc::clone(&ctx), trigger);
        Self {
            ctx,
            dispatcher,
            retry,
        }
    }

    pub fn context(&self) -> &Arc<SagaContext<S>> {
        &self.ctx
    }

    pub fn retry_manager(&self) -> &RetryManager<S> {
        &self.retry
    }

    /// Starts a registration saga and its first step.
    ///
    /// The saga is created `PENDING` and `CREATE_USER` is started before this
    /// returns, so the stored saga is already `IN_PROGRESS`. Only a saga id
    /// collision is an error. A failed write is logged and counted and the
    /// id is still returned.
    #[tracing::instrument(skip(self), fields(saga_type = registration::SAGA_TYPE))]
    pub async fn start_saga(&self, correlation_id: String) -> Result<SagaId> {
        let saga_id = SagaId::new();
        let mut state = SagaState::new(saga_id, correlation_id, self.ctx.now());
        for step in registration::plan() {
            state.add_step(step)?;
        }

        let guard = self.ctx.locks().acquire(saga_id).await;
        match self.ctx.repository().insert(&mut state).await {
            Ok(()) => {}
            Err(e @ SagaError::DuplicateSaga(_)) => {
                tracing::error!(%saga_id, "saga id collision in state store");
                return Err(e);
            }
            Err(e) => {
                metrics::counter!("saga_persistence_failures_total").increment(1);
                tracing::error!(%saga_id, error = %e, "failed to persist new saga");
            }
        }
        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(%saga_id, correlation_id = state.correlation_id(), "saga started");

        let request = self.ctx.start_next_step(&mut state)?;
        self.ctx.sync_active(&state).await;
        if let Err(e) = self.ctx.persist(&mut state).await {
            tracing::warn!(%saga_id, error = %e, "continuing with unsaved first step");
        }
        drop(guard);

        if let Some(request) = request {
            self.dispatcher.spawn(request);
        }
        Ok(saga_id)
    }

    /// Applies an inbound event to its saga.
    ///
    /// Returns once the transition is stored; the next step is handed off in
    /// the background. Returns [`SagaError::UnknownSaga`] if the saga is not
    /// in the store. A [`SagaError::Persistence`] error means the transition
    /// was applied and acted on but could not be written.
    #[tracing::instrument(
        skip(self, event),
        fields(saga_id = %event.saga_id, event_type = event.event_type())
    )]
    pub async fn handle_event(&self, event: SagaEvent) -> Result<EventOutcome> {
        let saga_id = event.saga_id;
        let _guard = self.ctx.locks().acquire(saga_id).await;
        let mut state = self
            .ctx
            .repository()
            .load(saga_id)
            .await?
            .ok_or(SagaError::UnknownSaga(saga_id))?;

        if state.status().is_terminal() {
            tracing::info!(status = %state.status(), "event for finished saga dropped");
            return Ok(EventOutcome::Ignored(IgnoreReason::TerminalState(
                state.status(),
            )));
        }

        match event.kind() {
            EventKind::StepSucceeded { step } => self.on_step_succeeded(&mut state, step).await,
            EventKind::StepFailed {
                step,
                error_message,
            } => self.on_step_failed(&mut state, step, error_message).await,
            EventKind::Compensation => self.on_compensation(&mut state).await,
        }
    }

    async fn on_step_succeeded(
        &self,
        state: &mut SagaState,
        step: &'static str,
    ) -> Result<EventOutcome> {
        if state.status() == SagaStatus::Failed {
            return Ok(EventOutcome::Ignored(IgnoreReason::CompensationPending));
        }

        let status = state
            .step(step)
            .map(|s| s.status())
            .ok_or_else(|| SagaError::StepNotFound {
                saga_id: state.saga_id(),
                step: step.to_string(),
            })?;
        match status {
            StepStatus::InProgress => {}
            StepStatus::Completed => {
                tracing::debug!(step, "duplicate success event");
                return Ok(EventOutcome::Ignored(IgnoreReason::Duplicate));
            }
            other => {
                tracing::warn!(step, status = %other, "success event for step that is not running");
                return Ok(EventOutcome::Ignored(IgnoreReason::OutOfOrder));
            }
        }

        let advance = self.ctx.complete_and_advance(state, step).await?;
        if let Some(request) = advance.request {
            self.dispatcher.spawn(request);
        }
        advance.persisted.map(|()| advance.outcome)
    }

    async fn on_step_failed(
        &self,
        state: &mut SagaState,
        step: &'static str,
        error_message: &str,
    ) -> Result<EventOutcome> {
        let status = state
            .step(step)
            .map(|s| s.status())
            .ok_or_else(|| SagaError::StepNotFound {
                saga_id: state.saga_id(),
                step: step.to_string(),
            })?;
        match status {
            StepStatus::InProgress if state.status().accepts_step_results() => {}
            StepStatus::Failed | StepStatus::Compensated => {
                return Ok(EventOutcome::Ignored(IgnoreReason::Duplicate));
            }
            _ if state.status() == SagaStatus::Failed => {
                return Ok(EventOutcome::Ignored(IgnoreReason::CompensationPending));
            }
            other => {
                tracing::warn!(step, status = %other, "failure event for step that is not running");
                return Ok(EventOutcome::Ignored(IgnoreReason::OutOfOrder));
            }
        }

        let compensated_step = self
            .ctx
            .fail_step_and_compensate(
                state,
                step,
                error_message,
                registration::failure_reason(step),
                HashMap::new(),
            )
            .await?;

        Ok(EventOutcome::CompensationTriggered {
            failed_step: step.to_string(),
            compensated_step,
        })
    }

    async fn on_compensation(&self, state: &mut SagaState) -> Result<EventOutcome> {
        state.mark_compensated(self.ctx.now())?;
        metrics::counter!("saga_compensated_total").increment(1);
        self.ctx.record_duration(state);
        tracing::info!("saga compensated");

        self.ctx.sync_active(state).await;
        self.ctx.persist(state).await?;
        Ok(EventOutcome::Compensated)
    }

    /// Ids of sagas currently `IN_PROGRESS`.
    pub async fn active_saga_ids(&self) -> Vec<SagaId> {
        self.ctx.active_ids().await
    }

    /// Waits for step hand-offs and other background work started so far.
    pub async fn settle(&self) {
        self.ctx.settle().await;
    }

    /// Reads a saga's current state.
    pub async fn get_saga_state(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        self.ctx.repository().load(saga_id).await
    }
}

impl<S> std::fmt::Debug for SagaOrchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator").finish_non_exhaustive()
    }
}
