//! Recording step trigger for tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::trigger::{StepRequest, StepTrigger};
use crate::error::SagaError;

#[derive(Debug, Default)]
struct InMemoryTriggerState {
    requests: Vec<StepRequest>,
    fail_next: u32,
    fail_always: bool,
}

/// In-memory step trigger that records every request.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStepTrigger {
    state: Arc<Mutex<InMemoryTriggerState>>,
}

impl InMemoryStepTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryTriggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Configures every call to fail with a transient error.
    pub fn set_fail_on_trigger(&self, fail: bool) {
        self.lock().fail_always = fail;
    }

    /// Number of calls received, failed ones included.
    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<StepRequest> {
        self.lock().requests.clone()
    }

    /// Step names of every request received, in order.
    pub fn triggered_steps(&self) -> Vec<String> {
        self.lock()
            .requests
            .iter()
            .map(|r| r.step_name.clone())
            .collect()
    }
}

#[async_trait]
impl StepTrigger for InMemoryStepTrigger {
    async fn trigger(&self, request: &StepRequest) -> Result<(), SagaError> {
        let mut state = self.lock();
        state.requests.push(request.clone());

        if state.fail_always {
            return Err(SagaError::step_execution(
                &request.step_name,
                format!("{} unavailable", request.service_name),
            ));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SagaError::step_execution(
                &request.step_name,
                format!("{} unavailable", request.service_name),
            ));
        }
        Ok(())
    }
}
