//! Saga state persistence on top of a [`StateStore`].

use common::SagaId;
use state_store::{StateStore, StateStoreError, StateStoreExt, Version};

use crate::error::{Result, SagaError};
use crate::model::SagaState;

/// Typed access to saga documents.
///
/// Maps store failures onto [`SagaError::Persistence`] and keeps the
/// in-memory [`SagaState::version`] in step with the stored one.
#[derive(Debug, Clone)]
pub struct SagaRepository<S> {
    store: S,
}

impl<S: StateStore> SagaRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads a saga. Expired and missing sagas both read as `None`.
    pub async fn load(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        let loaded = self
            .store
            .get_as::<SagaState>(saga_id)
            .await
            .map_err(|e| SagaError::persistence(saga_id, e))?;

        Ok(loaded.map(|(mut state, version)| {
            state.set_version(version);
            state
        }))
    }

    /// Writes a saga that has never been stored.
    pub async fn insert(&self, state: &mut SagaState) -> Result<()> {
        let saga_id = state.saga_id();
        match self
            .store
            .save_as(saga_id, &*state, Version::initial())
            .await
        {
            Ok(version) => {
                state.set_version(version);
                Ok(())
            }
            Err(StateStoreError::ConcurrencyConflict { .. }) => {
                Err(SagaError::DuplicateSaga(saga_id))
            }
            Err(e) => Err(SagaError::persistence(saga_id, e)),
        }
    }

    /// Writes back a saga read at [`SagaState::version`] and refreshes its TTL.
    pub async fn save(&self, state: &mut SagaState) -> Result<()> {
        let saga_id = state.saga_id();
        let version = self
            .store
            .save_as(saga_id, &*state, state.version())
            .await
            .map_err(|e| SagaError::persistence(saga_id, e))?;
        state.set_version(version);
        Ok(())
    }

    pub async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        self.store
            .exists(saga_id)
            .await
            .map_err(|e| SagaError::persistence(saga_id, e))
    }

    pub async fn delete(&self, saga_id: SagaId) -> Result<bool> {
        self.store
            .delete(saga_id)
            .await
            .map_err(|e| SagaError::persistence(saga_id, e))
    }

    /// Resets the saga's TTL without rewriting it.
    pub async fn extend_ttl(&self, saga_id: SagaId) -> Result<bool> {
        self.store
            .extend_ttl(saga_id)
            .await
            .map_err(|e| SagaError::persistence(saga_id, e))
    }
}
