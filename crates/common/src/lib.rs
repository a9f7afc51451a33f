//! Shared types for the saga orchestration system.

pub mod clock;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use types::{EventId, SagaId};
