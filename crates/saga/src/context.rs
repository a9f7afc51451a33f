//! State shared by the orchestrator, the retry manager and the timeout
//! manager.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use common::{Clock, SagaId, SystemClock};
use serde_json::{Value, json};
use state_store::StateStore;
use tokio::sync::RwLock;
use tokio::task::JoinSet;

use crate::channel::EventChannel;
use crate::error::Result;
use crate::events::SagaEvent;
use crate::locks::SagaLocks;
use crate::model::SagaState;
use crate::orchestrator::EventOutcome;
use crate::repository::SagaRepository;
use crate::services::StepRequest;
use crate::state::SagaStatus;

/// Result of completing a step: what happened, the next step to hand off
/// and whether the write went through.
pub(crate) struct Advance {
    pub outcome: EventOutcome,
    pub request: Option<StepRequest>,
    pub persisted: Result<()>,
}

/// Persistence, transport, locking and time for the saga drivers.
pub struct SagaContext<S> {
    repository: SagaRepository<S>,
    channel: Arc<dyn EventChannel>,
    locks: SagaLocks,
    clock: Arc<dyn Clock>,
    active: RwLock<HashSet<SagaId>>,
    tasks: Mutex<JoinSet<()>>,
}

impl<S: StateStore> SagaContext<S> {
    /// Creates a context on the system clock.
    pub fn new(store: S, channel: Arc<dyn EventChannel>) -> Self {
        Self {
            repository: SagaRepository::new(store),
            channel,
            locks: SagaLocks::new(),
            clock: Arc::new(SystemClock),
            active: RwLock::new(HashSet::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Replaces the clock used for timestamps and deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn repository(&self) -> &SagaRepository<S> {
        &self.repository
    }

    pub fn locks(&self) -> &SagaLocks {
        &self.locks
    }

    pub fn channel(&self) -> &Arc<dyn EventChannel> {
        &self.channel
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Ids of sagas currently `IN_PROGRESS`.
    pub async fn active_ids(&self) -> Vec<SagaId> {
        let mut ids: Vec<_> = self.active.read().await.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Keeps the active registry in line with the saga's status.
    pub(crate) async fn sync_active(&self, state: &SagaState) {
        let mut active = self.active.write().await;
        if state.status() == SagaStatus::InProgress {
            active.insert(state.saga_id());
        } else {
            active.remove(&state.saga_id());
        }
        metrics::gauge!("saga_active").set(active.len() as f64);
    }

    pub(crate) async fn forget(&self, saga_id: SagaId) {
        let mut active = self.active.write().await;
        active.remove(&saga_id);
        metrics::gauge!("saga_active").set(active.len() as f64);
    }

    /// Runs `task` in the background, tracked until [`settle`](Self::settle)
    /// or the context is dropped.
    pub(crate) fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so the set only holds running ones.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Waits for every background task, including ones spawned while
    /// waiting.
    pub async fn settle(&self) {
        loop {
            let mut pending =
                std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "background saga task failed");
                }
            }
        }
    }

    /// Starts the first pending step and returns the request to send to its
    /// service.
    pub(crate) fn start_next_step(&self, state: &mut SagaState) -> Result<Option<StepRequest>> {
        let Some(next) = state.next_pending_step() else {
            return Ok(None);
        };
        let request = StepRequest {
            saga_id: state.saga_id(),
            correlation_id: state.correlation_id().to_string(),
            step_name: next.step_name().to_string(),
            service_name: next.service_name().to_string(),
            step_data: next.step_data().cloned(),
        };

        state.start_step(&request.step_name, self.now())?;
        tracing::info!(
            saga_id = %request.saga_id,
            step = %request.step_name,
            service = %request.service_name,
            "saga step started"
        );
        Ok(Some(request))
    }

    /// Completes a running step and starts the next one, or completes the
    /// saga when every step is done. The state is persisted; handing the
    /// next step off is left to the caller, after the lock is released.
    pub(crate) async fn complete_and_advance(
        &self,
        state: &mut SagaState,
        step: &str,
    ) -> Result<Advance> {
        let now = self.now();
        state.complete_step(step, now)?;
        tracing::info!(saga_id = %state.saga_id(), step, "saga step completed");

        let request = self.start_next_step(state)?;
        let outcome = match &request {
            Some(next) => EventOutcome::Advanced {
                completed_step: step.to_string(),
                next_step: next.step_name.clone(),
            },
            None => {
                state.mark_completed(now)?;
                metrics::counter!("saga_completed_total").increment(1);
                self.record_duration(state);
                tracing::info!(saga_id = %state.saga_id(), "saga completed");
                EventOutcome::Completed
            }
        };

        self.sync_active(state).await;
        let persisted = self.persist(state).await;
        Ok(Advance {
            outcome,
            request,
            persisted,
        })
    }

    /// Writes the saga back to the store.
    ///
    /// A failure is logged and counted before it is returned; callers carry
    /// on with the decision they made and surface the error afterwards.
    pub(crate) async fn persist(&self, state: &mut SagaState) -> Result<()> {
        let result = self.repository.save(state).await;
        if let Err(e) = &result {
            metrics::counter!("saga_persistence_failures_total").increment(1);
            tracing::error!(
                saga_id = %state.saga_id(),
                status = %state.status(),
                error = %e,
                "failed to persist saga state, durable copy is stale"
            );
        }
        result
    }

    /// Publishes an event without waiting on or retrying the transport.
    pub(crate) async fn publish(&self, event: &SagaEvent) {
        match self.channel.publish(event).await {
            Ok(()) => {
                metrics::counter!("saga_events_published_total").increment(1);
                tracing::debug!(
                    saga_id = %event.saga_id,
                    event_type = event.event_type(),
                    "event published"
                );
            }
            Err(e) => {
                metrics::counter!("saga_publish_failures_total").increment(1);
                tracing::error!(
                    saga_id = %event.saga_id,
                    event_type = event.event_type(),
                    error = %e,
                    "failed to publish event"
                );
            }
        }
    }

    /// Requests compensation of the last completed step.
    ///
    /// `data` is merged into the event's compensation data. Returns the step
    /// that will be compensated, or `None` when nothing has completed yet and
    /// no event was published.
    pub(crate) async fn trigger_compensation(
        &self,
        state: &SagaState,
        reason: &str,
        mut data: HashMap<String, Value>,
    ) -> Option<String> {
        let Some(step) = state.last_completed_step() else {
            tracing::info!(
                saga_id = %state.saga_id(),
                reason,
                "no completed step, nothing to compensate"
            );
            return None;
        };

        data.insert(
            "compensationAction".to_string(),
            json!(step.compensation_action().unwrap_or_default()),
        );
        let event = SagaEvent::compensation(
            state.saga_id(),
            state.correlation_id(),
            self.now(),
            reason,
            Some(step.step_name().to_string()),
            data,
        );

        metrics::counter!("saga_compensation_triggered_total").increment(1);
        tracing::warn!(
            saga_id = %state.saga_id(),
            step = step.step_name(),
            reason,
            "compensation triggered"
        );
        self.publish(&event).await;
        Some(step.step_name().to_string())
    }

    /// Publishes the compensation request for a missed deadline.
    pub(crate) async fn trigger_deadline_compensation(&self, state: &SagaState, reason: &str) {
        let mut data = HashMap::new();
        data.insert("timeout".to_string(), json!(true));
        data.insert("reason".to_string(), json!(reason));

        let event = SagaEvent::compensation(
            state.saga_id(),
            state.correlation_id(),
            self.now(),
            reason,
            state.current_step().map(str::to_string),
            data,
        );

        metrics::counter!("saga_compensation_triggered_total").increment(1);
        self.publish(&event).await;
    }

    /// Fails an executing step with `error_message`, fails the saga with
    /// `reason`, persists it and requests compensation.
    ///
    /// Compensation is published even if the write fails; the write error is
    /// returned afterwards.
    pub(crate) async fn fail_step_and_compensate(
        &self,
        state: &mut SagaState,
        step: &str,
        error_message: &str,
        reason: &str,
        data: HashMap<String, Value>,
    ) -> Result<Option<String>> {
        state.fail_step(step, error_message, reason, self.now())?;
        metrics::counter!("saga_failed_total").increment(1);
        tracing::warn!(
            saga_id = %state.saga_id(),
            step,
            error = error_message,
            "saga step failed"
        );

        self.sync_active(state).await;
        let persisted = self.persist(state).await;
        let compensated = self.trigger_compensation(state, reason, data).await;
        persisted.map(|()| compensated)
    }

    /// Records the end of a saga in the duration histogram.
    pub(crate) fn record_duration(&self, state: &SagaState) {
        if let Some(end) = state.end_time() {
            let elapsed = (end - state.start_time()).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!("saga_duration_seconds").record(elapsed);
        }
    }
}

impl<S> std::fmt::Debug for SagaContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryEventChannel;
    use crate::events::SAGA_COMPENSATION;
    use crate::registration;
    use chrono::Utc;
    use state_store::InMemoryStateStore;

    fn context() -> (SagaContext<InMemoryStateStore>, InMemoryEventChannel) {
        let channel = InMemoryEventChannel::with_history(1);
        let ctx = SagaContext::new(InMemoryStateStore::new(), Arc::new(channel.clone()));
        (ctx, channel)
    }

    async fn stored_saga(ctx: &SagaContext<InMemoryStateStore>) -> SagaState {
        let mut state = SagaState::new(SagaId::new(), "c", Utc::now());
        for step in registration::plan() {
            state.add_step(step).unwrap();
        }
        ctx.repository().insert(&mut state).await.unwrap();
        state
    }

    #[tokio::test]
    async fn test_compensation_targets_last_completed_step() {
        let (ctx, channel) = context();
        let mut state = stored_saga(&ctx).await;
        let now = Utc::now();
        state.start_step(registration::STEP_CREATE_USER, now).unwrap();
        state.complete_step(registration::STEP_CREATE_USER, now).unwrap();
        state.start_step(registration::STEP_SETUP_ALERTS, now).unwrap();

        let compensated = ctx
            .fail_step_and_compensate(
                &mut state,
                registration::STEP_SETUP_ALERTS,
                "x",
                "Alert setup failed",
                HashMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(compensated.as_deref(), Some(registration::STEP_CREATE_USER));

        let events = channel.published_of_type(SAGA_COMPENSATION);
        assert_eq!(events.len(), 1);
        let data = events[0].as_compensation().unwrap();
        assert_eq!(data.failed_step.as_deref(), Some(registration::STEP_CREATE_USER));
        assert_eq!(data.compensation_data["compensationAction"], "DELETE_USER");
    }

    #[tokio::test]
    async fn test_no_compensation_without_completed_step() {
        let (ctx, channel) = context();
        let mut state = stored_saga(&ctx).await;
        state
            .start_step(registration::STEP_CREATE_USER, Utc::now())
            .unwrap();

        let compensated = ctx
            .fail_step_and_compensate(
                &mut state,
                registration::STEP_CREATE_USER,
                "x",
                "User creation failed",
                HashMap::new(),
            )
            .await
            .unwrap();
        assert!(compensated.is_none());
        assert!(channel.published().is_empty());
        assert!(state.compensation_required());
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_decision() {
        let (ctx, channel) = context();
        channel.set_fail_on_publish(true);
        let mut state = stored_saga(&ctx).await;
        state
            .start_step(registration::STEP_CREATE_USER, Utc::now())
            .unwrap();

        ctx.trigger_deadline_compensation(&state, "Saga timeout").await;
        assert!(channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_active_registry_follows_status() {
        let (ctx, _channel) = context();
        let mut state = stored_saga(&ctx).await;
        state
            .start_step(registration::STEP_CREATE_USER, Utc::now())
            .unwrap();

        ctx.sync_active(&state).await;
        assert_eq!(ctx.active_ids().await, vec![state.saga_id()]);

        state.mark_failed("x").unwrap();
        ctx.sync_active(&state).await;
        assert!(ctx.active_ids().await.is_empty());
    }
}
