//! Collaborator interfaces driven by the orchestrator.

pub mod in_memory;
pub mod trigger;

pub use in_memory::InMemoryStepTrigger;
pub use trigger::{LoggingStepTrigger, StepRequest, StepTrigger};
