//! Bounded exponential-backoff retry of a single step's remote action.
//!
//! Attempt `n` (zero-based) runs after `RETRY_BASE_DELAY * 2^n`, giving
//! delays of 5s, 10s and 20s. Once [`MAX_RETRY_ATTEMPTS`] attempts have
//! failed the step is marked `FAILED` and compensation is requested. A
//! successful attempt advances the saga like a success event would.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::json;
use state_store::StateStore;
use tokio::task::JoinHandle;

use crate::context::SagaContext;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SagaError};
use crate::services::StepTrigger;
use crate::state::StepStatus;

/// Attempts made before a step is given up on.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay before the first attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Failure message recorded on a step whose retries ran out.
pub const RETRY_EXHAUSTED_REASON: &str = "max retry attempts reached";

/// A step's remote action, callable once per attempt.
pub type StepAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps a closure returning a future as a [`StepAction`].
pub fn step_action<F, Fut>(f: F) -> StepAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Delay before attempt `attempt` (zero-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt))
}

/// What a successful attempt means for the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// The action performs the step; success completes it.
    MarkCompleted,
    /// The action only hands the step off; its result event completes it.
    AwaitResultEvent,
}

/// How a scheduled retry ended.
///
/// `persisted` is false when a write made along the way failed, so the
/// stored saga lags behind what the retry did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// An attempt succeeded. `attempts` counts every attempt made.
    Succeeded { attempts: u32, persisted: bool },
    /// Every attempt failed; compensation was requested.
    Exhausted { attempts: u32, persisted: bool },
    /// The saga moved on without the retry, e.g. it timed out or the result
    /// event arrived.
    Abandoned { reason: String },
    /// The handle was cancelled.
    Cancelled,
}

/// Handle to a scheduled retry.
#[derive(Debug)]
pub struct RetryHandle {
    saga_id: SagaId,
    step_name: String,
    task: JoinHandle<RetryOutcome>,
}

impl RetryHandle {
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Stops further attempts. An attempt already running is dropped.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the retry to end.
    pub async fn outcome(self) -> RetryOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => RetryOutcome::Cancelled,
            Err(e) => RetryOutcome::Abandoned {
                reason: format!("retry task failed: {e}"),
            },
        }
    }
}

/// Schedules step retries against the shared saga state.
///
/// `trigger` hands off the step that follows one completed by a retry.
pub struct RetryManager<S> {
    ctx: Arc<SagaContext<S>>,
    trigger: Arc<dyn StepTrigger>,
}

impl<S> Clone for RetryManager<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            trigger: Arc::clone(&self.trigger),
        }
    }
}

impl<S: StateStore + 'static> RetryManager<S> {
    pub fn new(ctx: Arc<SagaContext<S>>, trigger: Arc<dyn StepTrigger>) -> Self {
        Self { ctx, trigger }
    }

    /// Retries `action` for `step_name`, starting at `attempt`.
    ///
    /// A successful attempt marks the step `COMPLETED` and starts the next
    /// step, or completes the saga after the last one. An `attempt` of
    /// [`MAX_RETRY_ATTEMPTS`] or more fails the step without running it.
    #[tracing::instrument(skip(self, action))]
    pub fn schedule_retry(
        &self,
        saga_id: SagaId,
        step_name: &str,
        action: StepAction,
        attempt: u32,
    ) -> RetryHandle {
        self.schedule(saga_id, step_name, action, attempt, RetryMode::MarkCompleted)
    }

    /// Retries handing a step off to its owning service. A successful
    /// attempt leaves the step `IN_PROGRESS`.
    pub(crate) fn schedule_dispatch(
        &self,
        saga_id: SagaId,
        step_name: &str,
        action: StepAction,
        attempt: u32,
    ) -> RetryHandle {
        self.schedule(saga_id, step_name, action, attempt, RetryMode::AwaitResultEvent)
    }

    fn schedule(
        &self,
        saga_id: SagaId,
        step_name: &str,
        action: StepAction,
        attempt: u32,
        mode: RetryMode,
    ) -> RetryHandle {
        let dispatcher = Dispatcher::new(Arc::clone(&self.ctx), Arc::clone(&self.trigger));
        let ctx = Arc::clone(&self.ctx);
        let step = step_name.to_string();
        let task = tokio::spawn(async move {
            run(ctx, dispatcher, saga_id, step, action, attempt, mode).await
        });

        RetryHandle {
            saga_id,
            step_name: step_name.to_string(),
            task,
        }
    }

    /// Returns true if the step has failed and has attempts left.
    pub async fn should_retry(&self, saga_id: SagaId, step_name: &str) -> Result<bool> {
        let state = self
            .ctx
            .repository()
            .load(saga_id)
            .await?
            .ok_or(SagaError::UnknownSaga(saga_id))?;
        let step = state.step(step_name).ok_or_else(|| SagaError::StepNotFound {
            saga_id,
            step: step_name.to_string(),
        })?;
        Ok(step.status() == StepStatus::Failed && step.retry_count() < MAX_RETRY_ATTEMPTS)
    }
}

async fn run<S: StateStore + 'static>(
    ctx: Arc<SagaContext<S>>,
    dispatcher: Dispatcher<S>,
    saga_id: SagaId,
    step: String,
    action: StepAction,
    mut attempt: u32,
    mode: RetryMode,
) -> RetryOutcome {
    let mut persisted = true;
    loop {
        if attempt >= MAX_RETRY_ATTEMPTS {
            return match exhaust(&ctx, saga_id, &step, attempt).await {
                RetryOutcome::Exhausted {
                    attempts,
                    persisted: written,
                } => RetryOutcome::Exhausted {
                    attempts,
                    persisted: persisted && written,
                },
                other => other,
            };
        }

        tokio::time::sleep(backoff_delay(attempt)).await;

        match begin_attempt(&ctx, saga_id, &step).await {
            Ok(written) => persisted &= written,
            Err(reason) => {
                tracing::info!(%saga_id, %step, %reason, "retry abandoned");
                return RetryOutcome::Abandoned { reason };
            }
        }

        metrics::counter!("saga_step_retry_total").increment(1);
        tracing::info!(%saga_id, %step, attempt = attempt + 1, "retrying step");

        match action().await {
            Ok(()) => {
                if mode == RetryMode::MarkCompleted {
                    persisted &= complete(&ctx, &dispatcher, saga_id, &step).await;
                }
                return RetryOutcome::Succeeded {
                    attempts: attempt + 1,
                    persisted,
                };
            }
            Err(e) => {
                tracing::warn!(
                    %saga_id,
                    %step,
                    attempt = attempt + 1,
                    error = %e,
                    "step attempt failed"
                );
                attempt += 1;
            }
        }
    }
}

/// Counts the attempt against the step, starting it if it never started.
///
/// Returns whether the counter was written, or the reason to give up if the
/// saga no longer needs the step.
async fn begin_attempt<S: StateStore>(
    ctx: &SagaContext<S>,
    saga_id: SagaId,
    step: &str,
) -> std::result::Result<bool, String> {
    let _guard = ctx.locks().acquire(saga_id).await;
    let mut state = match ctx.repository().load(saga_id).await {
        Ok(Some(state)) => state,
        Ok(None) => return Err("saga no longer exists".to_string()),
        Err(e) => return Err(e.to_string()),
    };

    if !state.status().accepts_step_results() {
        return Err(format!("saga is {}", state.status()));
    }
    match state.step(step).map(|s| s.status()) {
        Some(StepStatus::Pending) => {
            state
                .start_step(step, ctx.now())
                .map_err(|e| e.to_string())?;
        }
        Some(StepStatus::InProgress) => {}
        Some(status) => return Err(format!("step is {status}")),
        None => return Err("step not found".to_string()),
    }

    state.record_attempt(step).map_err(|e| e.to_string())?;
    ctx.sync_active(&state).await;
    // The attempt still runs if the counter could not be written.
    Ok(ctx.persist(&mut state).await.is_ok())
}

/// Completes the retried step and advances the saga. The next step is
/// handed off once the lock is released.
///
/// Returns false if the result could not be read or written.
async fn complete<S: StateStore + 'static>(
    ctx: &SagaContext<S>,
    dispatcher: &Dispatcher<S>,
    saga_id: SagaId,
    step: &str,
) -> bool {
    let guard = ctx.locks().acquire(saga_id).await;
    let mut state = match ctx.repository().load(saga_id).await {
        Ok(Some(state)) => state,
        Ok(None) => return true,
        Err(e) => {
            tracing::error!(%saga_id, step, error = %e, "failed to load saga after retry");
            return false;
        }
    };
    let running = state
        .step(step)
        .is_some_and(|s| s.status() == StepStatus::InProgress);
    if !running || !state.status().accepts_step_results() {
        return true;
    }

    let advance = match ctx.complete_and_advance(&mut state, step).await {
        Ok(advance) => advance,
        Err(e) => {
            tracing::warn!(%saga_id, step, error = %e, "could not complete retried step");
            return true;
        }
    };
    drop(guard);

    if let Some(request) = advance.request {
        dispatcher.spawn(request);
    }
    advance.persisted.is_ok()
}

async fn exhaust<S: StateStore>(
    ctx: &SagaContext<S>,
    saga_id: SagaId,
    step: &str,
    attempts: u32,
) -> RetryOutcome {
    let _guard = ctx.locks().acquire(saga_id).await;
    let mut state = match ctx.repository().load(saga_id).await {
        Ok(Some(state)) => state,
        Ok(None) => {
            return RetryOutcome::Abandoned {
                reason: "saga no longer exists".to_string(),
            };
        }
        Err(e) => {
            return RetryOutcome::Abandoned {
                reason: e.to_string(),
            };
        }
    };

    if !state.status().accepts_step_results() {
        return RetryOutcome::Abandoned {
            reason: format!("saga is {}", state.status()),
        };
    }
    if state.step(step).map(|s| s.status()) == Some(StepStatus::Pending)
        && let Err(e) = state.start_step(step, ctx.now())
    {
        return RetryOutcome::Abandoned {
            reason: e.to_string(),
        };
    }

    let mut data = HashMap::new();
    data.insert("retryExhausted".to_string(), json!(true));

    tracing::error!(%saga_id, step, attempts, "step retries exhausted");
    match ctx
        .fail_step_and_compensate(
            &mut state,
            step,
            RETRY_EXHAUSTED_REASON,
            RETRY_EXHAUSTED_REASON,
            data,
        )
        .await
    {
        Ok(_) => RetryOutcome::Exhausted {
            attempts,
            persisted: true,
        },
        Err(SagaError::Persistence { .. }) => RetryOutcome::Exhausted {
            attempts,
            persisted: false,
        },
        Err(e) => RetryOutcome::Abandoned {
            reason: e.to_string(),
        },
    }
}
