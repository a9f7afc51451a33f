//! Durable, keyed, TTL-backed persistence for saga state.
//!
//! Every saga is stored under [`state_key`] (`"saga:state:" + saga_id`) as a
//! JSON document with a version used for optimistic concurrency control.
//! Entries expire [`DEFAULT_TTL`] after their last write unless the TTL is
//! extended explicitly.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::SagaId;
pub use error::{Result, StateStoreError};
pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use record::{StateRecord, Version};
pub use store::{DEFAULT_TTL, KEY_PREFIX, StateStore, StateStoreExt, state_key};
