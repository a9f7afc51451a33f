//! Deadline detection for stalled sagas and steps.

use std::sync::Arc;
use std::time::Duration;

use common::SagaId;
use state_store::StateStore;
use tokio::task::{JoinHandle, JoinSet};

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::state::SagaStatus;

/// Time a saga may spend from start to finish.
pub const SAGA_TIMEOUT: chrono::TimeDelta = chrono::TimeDelta::minutes(10);

/// Time a single step may stay `IN_PROGRESS`.
pub const STEP_TIMEOUT: chrono::TimeDelta = chrono::TimeDelta::minutes(2);

/// Period of the background sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub const SAGA_TIMEOUT_REASON: &str = "Saga timeout exceeded";

/// Result of checking one saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Both deadlines are still ahead.
    NotExpired,
    /// The saga is not `IN_PROGRESS` and has no deadline to enforce.
    Skipped(SagaStatus),
    /// The saga deadline passed; it is now `TIMEOUT`.
    SagaTimedOut,
    /// A step overran; the step and the saga are now `FAILED`.
    StepTimedOut { step: String },
    /// The saga is no longer in the store.
    Missing,
}

/// Totals of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub saga_timeouts: usize,
    pub step_timeouts: usize,
    pub errors: usize,
}

/// Periodically fails sagas and steps that outlived their deadline.
pub struct TimeoutManager<S> {
    ctx: Arc<SagaContext<S>>,
}

impl<S> Clone for TimeoutManager<S> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<S: StateStore + 'static> TimeoutManager<S> {
    pub fn new(ctx: Arc<SagaContext<S>>) -> Self {
        Self { ctx }
    }

    /// Checks one saga against both deadlines under its lock.
    ///
    /// The saga deadline is checked first, so a saga that is past both
    /// produces a single compensation request. State is re-read under the
    /// lock; an event handled just before the check wins.
    #[tracing::instrument(skip(self))]
    pub async fn check_saga(&self, saga_id: SagaId) -> Result<TimeoutOutcome> {
        let _guard = self.ctx.locks().acquire(saga_id).await;
        let Some(mut state) = self.ctx.repository().load(saga_id).await? else {
            self.ctx.forget(saga_id).await;
            return Ok(TimeoutOutcome::Missing);
        };

        if state.status() != SagaStatus::InProgress {
            self.ctx.sync_active(&state).await;
            return Ok(TimeoutOutcome::Skipped(state.status()));
        }

        let now = self.ctx.now();
        if now - state.start_time() > SAGA_TIMEOUT {
            let err = SagaError::DeadlineExceeded {
                saga_id,
                scope: "saga".to_string(),
            };
            tracing::warn!(%saga_id, error = %err, "saga timed out");

            state.mark_timed_out(SAGA_TIMEOUT_REASON, now)?;
            metrics::counter!("saga_timed_out_total").increment(1);
            self.ctx.record_duration(&state);
            self.ctx.sync_active(&state).await;

            let persisted = self.ctx.persist(&mut state).await;
            self.ctx
                .trigger_deadline_compensation(&state, SAGA_TIMEOUT_REASON)
                .await;
            persisted?;
            return Ok(TimeoutOutcome::SagaTimedOut);
        }

        let overdue = state
            .in_progress_step()
            .filter(|step| {
                step.start_time()
                    .is_some_and(|started| now - started > STEP_TIMEOUT)
            })
            .map(|step| step.step_name().to_string());

        let Some(step) = overdue else {
            return Ok(TimeoutOutcome::NotExpired);
        };

        let reason = format!("Step timeout: {step}");
        tracing::warn!(%saga_id, %step, "step timed out");

        state.fail_step(&step, &reason, &reason, now)?;
        metrics::counter!("saga_failed_total").increment(1);
        self.ctx.sync_active(&state).await;

        let persisted = self.ctx.persist(&mut state).await;
        self.ctx.trigger_deadline_compensation(&state, &reason).await;
        persisted?;
        Ok(TimeoutOutcome::StepTimedOut { step })
    }

    /// Checks every active saga once.
    pub async fn sweep(&self) -> SweepReport {
        let ids = self.ctx.active_ids().await;
        let mut report = SweepReport {
            checked: ids.len(),
            ..SweepReport::default()
        };

        let mut checks = JoinSet::new();
        for saga_id in ids {
            let manager = self.clone();
            checks.spawn(async move { (saga_id, manager.check_saga(saga_id).await) });
        }

        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((_, Ok(TimeoutOutcome::SagaTimedOut))) => report.saga_timeouts += 1,
                Ok((_, Ok(TimeoutOutcome::StepTimedOut { .. }))) => report.step_timeouts += 1,
                Ok((_, Ok(_))) => {}
                Ok((saga_id, Err(e))) => {
                    report.errors += 1;
                    tracing::error!(%saga_id, error = %e, "timeout check failed");
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(error = %e, "timeout check task failed");
                }
            }
        }

        self.ctx.locks().prune().await;
        if report.saga_timeouts + report.step_timeouts > 0 {
            tracing::info!(?report, "timeout sweep finished");
        }
        report
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        })
    }

    /// Checks the saga once, just after its deadline.
    pub fn schedule_saga_timeout(&self, saga_id: SagaId) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let remaining = match manager.ctx.repository().load(saga_id).await {
                Ok(Some(state)) => state.start_time() + SAGA_TIMEOUT - manager.ctx.now(),
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(%saga_id, error = %e, "cannot schedule saga timeout");
                    return;
                }
            };
            let wait = remaining.to_std().unwrap_or(Duration::ZERO) + Duration::from_secs(1);
            tokio::time::sleep(wait).await;

            if let Err(e) = manager.check_saga(saga_id).await {
                tracing::error!(%saga_id, error = %e, "scheduled timeout check failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::FixedClock;
    use state_store::InMemoryStateStore;

    use crate::channel::InMemoryEventChannel;
    use crate::events::SAGA_COMPENSATION;
    use crate::model::SagaState;
    use crate::registration;
    use crate::state::StepStatus;

    struct Fixture {
        manager: TimeoutManager<InMemoryStateStore>,
        ctx: Arc<SagaContext<InMemoryStateStore>>,
        channel: InMemoryEventChannel,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let channel = InMemoryEventChannel::with_history(1);
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let ctx = Arc::new(
            SagaContext::new(InMemoryStateStore::new(), Arc::new(channel.clone()))
                .with_clock(clock.clone()),
        );
        Fixture {
            manager: TimeoutManager::new(Arc::clone(&ctx)),
            ctx,
            channel,
            clock,
        }
    }

    async fn running_saga(f: &Fixture) -> SagaId {
        let mut state = SagaState::new(SagaId::new(), "c", f.ctx.now());
        for step in registration::plan() {
            state.add_step(step).unwrap();
        }
        state
            .start_step(registration::STEP_CREATE_USER, f.ctx.now())
            .unwrap();
        f.ctx.repository().insert(&mut state).await.unwrap();
        f.ctx.sync_active(&state).await;
        state.saga_id()
    }

    #[tokio::test]
    async fn test_not_expired() {
        let f = fixture();
        let id = running_saga(&f).await;
        f.clock.advance(chrono::TimeDelta::seconds(90));

        assert_eq!(f.manager.check_saga(id).await.unwrap(), TimeoutOutcome::NotExpired);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let f = fixture();
        let id = running_saga(&f).await;
        f.clock.advance(chrono::TimeDelta::minutes(3));

        let outcome = f.manager.check_saga(id).await.unwrap();
        assert_eq!(
            outcome,
            TimeoutOutcome::StepTimedOut {
                step: registration::STEP_CREATE_USER.to_string()
            }
        );

        let state = f.ctx.repository().load(id).await.unwrap().unwrap();
        assert_eq!(state.status(), SagaStatus::Failed);
        assert!(state.compensation_required());
        assert_eq!(
            state.step(registration::STEP_CREATE_USER).unwrap().status(),
            StepStatus::Failed
        );

        let events = f.channel.published_of_type(SAGA_COMPENSATION);
        assert_eq!(events.len(), 1);
        let data = events[0].as_compensation().unwrap();
        assert_eq!(data.compensation_data["timeout"], true);
        assert_eq!(data.failed_step.as_deref(), Some(registration::STEP_CREATE_USER));
        assert!(f.ctx.active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_saga_deadline_checked_first() {
        let f = fixture();
        let id = running_saga(&f).await;
        f.clock.advance(chrono::TimeDelta::minutes(11));

        let report = f.manager.sweep().await;
        assert_eq!(
            report,
            SweepReport {
                checked: 1,
                saga_timeouts: 1,
                step_timeouts: 0,
                errors: 0
            }
        );

        let state = f.ctx.repository().load(id).await.unwrap().unwrap();
        assert_eq!(state.status(), SagaStatus::Timeout);
        assert!(state.end_time().is_some());
        assert_eq!(f.channel.published_of_type(SAGA_COMPENSATION).len(), 1);

        // Terminal now; nothing left to sweep.
        assert_eq!(f.manager.sweep().await.checked, 0);
        assert_eq!(
            f.manager.check_saga(id).await.unwrap(),
            TimeoutOutcome::Skipped(SagaStatus::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_check_fires_after_deadline() {
        let f = fixture();
        let id = running_saga(&f).await;

        // Waits out the full deadline; the saga clock has not moved.
        f.manager.schedule_saga_timeout(id).await.unwrap();
        let state = f.ctx.repository().load(id).await.unwrap().unwrap();
        assert_eq!(state.status(), SagaStatus::InProgress);

        f.clock.advance(chrono::TimeDelta::minutes(11));
        f.manager.schedule_saga_timeout(id).await.unwrap();
        let state = f.ctx.repository().load(id).await.unwrap().unwrap();
        assert_eq!(state.status(), SagaStatus::Timeout);
        assert_eq!(f.channel.published_of_type(SAGA_COMPENSATION).len(), 1);
    }

    #[tokio::test]
    async fn test_exactly_at_deadline_is_not_expired() {
        let f = fixture();
        let id = running_saga(&f).await;
        f.clock.advance(STEP_TIMEOUT);
        assert_eq!(f.manager.check_saga(id).await.unwrap(), TimeoutOutcome::NotExpired);
    }

    #[tokio::test]
    async fn test_missing_saga_leaves_registry() {
        let f = fixture();
        let id = running_saga(&f).await;
        f.ctx.repository().delete(id).await.unwrap();

        assert_eq!(f.manager.check_saga(id).await.unwrap(), TimeoutOutcome::Missing);
        assert!(f.ctx.active_ids().await.is_empty());
    }
}
