//! Saga and step status machines.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► InProgress ──┬──► Completed
///                          ├──► Failed ──► Compensated
///                          └──► Timeout
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Saga created, no step started yet.
    #[default]
    Pending,

    /// Steps are being executed.
    InProgress,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed; the saga is committed to compensation.
    Failed,

    /// Compensation was acknowledged (terminal state).
    Compensated,

    /// A deadline passed before the saga finished (terminal state).
    Timeout,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Timeout
        )
    }

    /// Returns true while step result events may still move the saga forward.
    pub fn accepts_step_results(&self) -> bool {
        matches!(self, SagaStatus::Pending | SagaStatus::InProgress)
    }

    /// Returns true if the saga may move to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        match (self, next) {
            (Pending, InProgress) => true,
            (InProgress, Completed) => true,
            (Pending | InProgress, Failed | Timeout) => true,
            (Pending | InProgress | Failed, Compensated) => true,
            _ => false,
        }
    }

    /// Returns the status name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::InProgress => "IN_PROGRESS",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The status of a single step.
///
/// Steps only ever move forward:
/// ```text
/// Pending ──► InProgress ──┬──► Completed
///    │                     └──► Failed ──► Compensated
///    └──► Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Compensated,
    Skipped,
}

impl StepStatus {
    /// Returns true if the step may move to `next`.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Compensated)
        )
    }

    /// Position in the forward order, used to check monotonicity.
    pub fn rank(&self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::InProgress => 1,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => 2,
            StepStatus::Compensated => 3,
        }
    }

    /// Returns the status name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Compensated => "COMPENSATED",
            StepStatus::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
