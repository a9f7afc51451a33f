//! Saga data model: one [`SagaState`] per in-flight transaction, holding an
//! ordered list of [`SagaStep`]s.

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use state_store::Version;

use crate::error::{Result, SagaError};
use crate::state::{SagaStatus, StepStatus};

/// One planned unit of work within a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStep {
    step_name: String,
    service_name: String,
    status: StepStatus,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
    compensation_action: Option<String>,
    step_data: Option<serde_json::Value>,
    /// Attempts made by the retry manager.
    #[serde(default)]
    retry_count: u32,
}

impl SagaStep {
    /// Creates a pending step.
    pub fn new(
        step_name: impl Into<String>,
        service_name: impl Into<String>,
        compensation_action: impl Into<String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            service_name: service_name.into(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            error_message: None,
            compensation_action: Some(compensation_action.into()),
            step_data: None,
            retry_count: 0,
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn compensation_action(&self) -> Option<&str> {
        self.compensation_action.as_deref()
    }

    pub fn step_data(&self) -> Option<&serde_json::Value> {
        self.step_data.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Moves the step to `next`.
    ///
    /// Returns `Ok(false)` if the step is already in `next`, so redelivered
    /// events are no-ops. Backward moves are rejected.
    pub fn transition(&mut self, next: StepStatus, at: DateTime<Utc>) -> Result<bool> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                subject: format!("step {}", self.step_name),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        match next {
            StepStatus::InProgress => self.start_time = Some(at),
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                self.end_time = Some(at)
            }
            StepStatus::Pending | StepStatus::Compensated => {}
        }
        self.status = next;
        Ok(true)
    }

    pub(crate) fn record_attempt(&mut self) {
        self.retry_count += 1;
    }
}

/// Persisted state of one saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaState {
    saga_id: SagaId,
    correlation_id: String,
    status: SagaStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    steps: Vec<SagaStep>,
    current_step: Option<String>,
    failure_reason: Option<String>,
    compensation_required: bool,
    /// Store version this copy was read at; owned by the store, not the document.
    #[serde(skip)]
    version: Version,
}

impl SagaState {
    /// Creates a pending saga with no steps.
    pub fn new(saga_id: SagaId, correlation_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            saga_id,
            correlation_id: correlation_id.into(),
            status: SagaStatus::Pending,
            start_time: now,
            end_time: None,
            steps: Vec::new(),
            current_step: None,
            failure_reason: None,
            compensation_required: false,
            version: Version::initial(),
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    /// Name of the step most recently added or started.
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn compensation_required(&self) -> bool {
        self.compensation_required
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Appends a step to the plan. Step names are unique within a saga.
    pub fn add_step(&mut self, step: SagaStep) -> Result<()> {
        if self.step(step.step_name()).is_some() {
            return Err(SagaError::InvalidTransition {
                subject: format!("saga {}", self.saga_id),
                from: format!("plan with {}", step.step_name()),
                to: format!("second {}", step.step_name()),
            });
        }
        self.current_step = Some(step.step_name.clone());
        self.steps.push(step);
        Ok(())
    }

    /// Looks up a step by name.
    pub fn step(&self, name: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    fn step_mut(&mut self, name: &str) -> Result<&mut SagaStep> {
        let saga_id = self.saga_id;
        self.steps
            .iter_mut()
            .find(|s| s.step_name == name)
            .ok_or_else(|| SagaError::StepNotFound {
                saga_id,
                step: name.to_string(),
            })
    }

    /// First step, in plan order, that has not started.
    pub fn next_pending_step(&self) -> Option<&SagaStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
    }

    /// The step currently executing, if any.
    pub fn in_progress_step(&self) -> Option<&SagaStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::InProgress)
    }

    /// The last step, in plan order, that completed.
    pub fn last_completed_step(&self) -> Option<&SagaStep> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Completed)
    }

    /// Starts a pending step and moves the saga to `InProgress`.
    ///
    /// Fails if another step is still executing.
    pub fn start_step(&mut self, name: &str, now: DateTime<Utc>) -> Result<bool> {
        if let Some(running) = self.in_progress_step()
            && running.step_name != name
        {
            return Err(SagaError::InvalidTransition {
                subject: format!("step {name}"),
                from: StepStatus::Pending.to_string(),
                to: format!("{} while {} is running", StepStatus::InProgress, running.step_name),
            });
        }

        let changed = self.step_mut(name)?.transition(StepStatus::InProgress, now)?;
        if changed {
            self.current_step = Some(name.to_string());
            if self.status == SagaStatus::Pending {
                self.set_status(SagaStatus::InProgress)?;
            }
        }
        Ok(changed)
    }

    /// Marks an executing step as completed.
    pub fn complete_step(&mut self, name: &str, now: DateTime<Utc>) -> Result<bool> {
        self.step_mut(name)?.transition(StepStatus::Completed, now)
    }

    /// Marks an executing step as failed with `message` and fails the saga
    /// with `reason`.
    pub fn fail_step(
        &mut self,
        name: &str,
        message: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let step = self.step_mut(name)?;
        let changed = step.transition(StepStatus::Failed, now)?;
        if changed {
            step.error_message = Some(message.to_string());
            self.mark_failed(reason)?;
        }
        Ok(changed)
    }

    /// Counts a retry attempt against a step.
    pub(crate) fn record_attempt(&mut self, name: &str) -> Result<u32> {
        let step = self.step_mut(name)?;
        step.record_attempt();
        Ok(step.retry_count)
    }

    /// Fails the saga and commits it to compensation.
    pub fn mark_failed(&mut self, reason: &str) -> Result<()> {
        if self.status != SagaStatus::Failed {
            self.set_status(SagaStatus::Failed)?;
        }
        self.record_failure(reason);
        Ok(())
    }

    /// Marks the saga as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.set_status(SagaStatus::Completed)?;
        self.finish(now);
        Ok(())
    }

    /// Records the compensation acknowledgment. Failed steps become
    /// `COMPENSATED`.
    pub fn mark_compensated(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.set_status(SagaStatus::Compensated)?;
        for step in self
            .steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::Failed)
        {
            step.transition(StepStatus::Compensated, now)?;
        }
        self.finish(now);
        Ok(())
    }

    /// Marks the saga as timed out and commits it to compensation.
    pub fn mark_timed_out(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.set_status(SagaStatus::Timeout)?;
        self.record_failure(reason);
        self.finish(now);
        Ok(())
    }

    fn set_status(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                subject: format!("saga {}", self.saga_id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    fn record_failure(&mut self, reason: &str) {
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason.to_string());
        }
        self.compensation_required = true;
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        if self.end_time.is_none() {
            self.end_time = Some(now);
        }
    }
}
