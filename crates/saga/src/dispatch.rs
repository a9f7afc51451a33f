//! Hands started steps to their owning services off the caller's task.

use std::collections::HashMap;
use std::sync::Arc;

use state_store::StateStore;

use crate::context::SagaContext;
use crate::error::Result;
use crate::registration;
use crate::retry::{RetryManager, step_action};
use crate::services::{StepRequest, StepTrigger};
use crate::state::StepStatus;

/// Sends step requests to collaborators in background tasks tracked by the
/// saga context.
pub(crate) struct Dispatcher<S> {
    ctx: Arc<SagaContext<S>>,
    trigger: Arc<dyn StepTrigger>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            trigger: Arc::clone(&self.trigger),
        }
    }
}

impl<S: StateStore + 'static> Dispatcher<S> {
    pub(crate) fn new(ctx: Arc<SagaContext<S>>, trigger: Arc<dyn StepTrigger>) -> Self {
        Self { ctx, trigger }
    }

    /// Dispatches `request` without waiting for the collaborator.
    pub(crate) fn spawn(&self, request: StepRequest) {
        let dispatcher = self.clone();
        self.ctx
            .spawn_task(async move { dispatcher.dispatch(request).await });
    }

    /// Calls the trigger. Transient failures go to the retry manager;
    /// anything else fails the step.
    async fn dispatch(&self, request: StepRequest) {
        let err = match self.trigger.trigger(&request).await {
            Ok(()) => return,
            Err(e) => e,
        };

        if err.is_transient() {
            tracing::warn!(
                saga_id = %request.saga_id,
                step = %request.step_name,
                error = %err,
                "step trigger failed, scheduling retry"
            );
            let trigger = Arc::clone(&self.trigger);
            let saga_id = request.saga_id;
            let step_name = request.step_name.clone();
            let action = step_action(move || {
                let trigger = Arc::clone(&trigger);
                let request = request.clone();
                async move { trigger.trigger(&request).await }
            });
            // Detached: the retry resolves itself through the saga state.
            let _ = RetryManager::new(Arc::clone(&self.ctx), Arc::clone(&self.trigger))
                .schedule_dispatch(saga_id, &step_name, action, 0);
            return;
        }

        tracing::error!(
            saga_id = %request.saga_id,
            step = %request.step_name,
            error = %err,
            "step trigger failed permanently"
        );
        if let Err(e) = self.fail(&request, &err.to_string()).await {
            tracing::error!(saga_id = %request.saga_id, error = %e, "failed to record step failure");
        }
    }

    async fn fail(&self, request: &StepRequest, message: &str) -> Result<()> {
        let _guard = self.ctx.locks().acquire(request.saga_id).await;
        let Some(mut state) = self.ctx.repository().load(request.saga_id).await? else {
            return Ok(());
        };
        let running = state
            .step(&request.step_name)
            .is_some_and(|s| s.status() == StepStatus::InProgress);
        if !running || !state.status().accepts_step_results() {
            return Ok(());
        }

        self.ctx
            .fail_step_and_compensate(
                &mut state,
                &request.step_name,
                message,
                registration::failure_reason(&request.step_name),
                HashMap::new(),
            )
            .await
            .map(|_| ())
    }
}
