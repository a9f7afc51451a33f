//! Outbound step triggers.

use async_trait::async_trait;
use common::SagaId;

use crate::error::SagaError;

/// Everything a collaborator needs to start its step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    pub saga_id: SagaId,
    pub correlation_id: String,
    pub step_name: String,
    pub service_name: String,
    pub step_data: Option<serde_json::Value>,
}

/// Starts a step's remote work.
///
/// Called after a step moves to `IN_PROGRESS`. A successful call only means
/// the request was handed off; the step completes when its result event
/// arrives. A [`SagaError::StepExecution`] error is retried with backoff.
#[async_trait]
pub trait StepTrigger: Send + Sync {
    async fn trigger(&self, request: &StepRequest) -> Result<(), SagaError>;
}

/// Trigger for deployments where collaborators react to the event channel
/// on their own. It only records the hand-off in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingStepTrigger;

#[async_trait]
impl StepTrigger for LoggingStepTrigger {
    async fn trigger(&self, request: &StepRequest) -> Result<(), SagaError> {
        tracing::info!(
            saga_id = %request.saga_id,
            step = %request.step_name,
            service = %request.service_name,
            "step triggered"
        );
        Ok(())
    }
}
