use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Result, SagaId, StateRecord, Version};

/// Prefix of every saga state key.
pub const KEY_PREFIX: &str = "saga:state:";

/// Time to live of a saga document after its last write.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Returns the storage key of a saga: `"saga:state:" + saga_id`.
pub fn state_key(saga_id: SagaId) -> String {
    format!("{KEY_PREFIX}{saga_id}")
}

/// Core trait for saga state persistence.
///
/// Implementations behave like a key-value store with per-key expiry: an
/// entry whose TTL has elapsed is indistinguishable from a missing one.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Writes the document for `saga_id` and refreshes its TTL.
    ///
    /// `expected` is the version the writer last read ([`Version::initial`]
    /// for a saga that has never been written). The write fails with
    /// `ConcurrencyConflict` if the stored version differs.
    ///
    /// Returns the new version.
    async fn save(
        &self,
        saga_id: SagaId,
        payload: serde_json::Value,
        expected: Version,
    ) -> Result<Version>;

    /// Reads the live document for `saga_id`, if any.
    async fn get(&self, saga_id: SagaId) -> Result<Option<StateRecord>>;

    /// Removes the document. Returns true if a live entry was removed.
    async fn delete(&self, saga_id: SagaId) -> Result<bool>;

    /// Returns true if a live entry exists.
    async fn exists(&self, saga_id: SagaId) -> Result<bool>;

    /// Resets the TTL of a live entry. Returns false if there is none.
    async fn extend_ttl(&self, saga_id: SagaId) -> Result<bool>;

    /// Drops every expired entry, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Extension trait providing typed access on top of [`StateStore`].
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Serializes `value` and saves it.
    async fn save_as<T>(&self, saga_id: SagaId, value: &T, expected: Version) -> Result<Version>
    where
        T: Serialize + Sync,
    {
        let payload = serde_json::to_value(value)?;
        self.save(saga_id, payload, expected).await
    }

    /// Loads and deserializes a document together with its version.
    async fn get_as<T>(&self, saga_id: SagaId) -> Result<Option<(T, Version)>>
    where
        T: DeserializeOwned,
    {
        match self.get(saga_id).await? {
            Some(record) => {
                let value = serde_json::from_value(record.payload)?;
                Ok(Some((value, record.version)))
            }
            None => Ok(None),
        }
    }
}

// Blanket implementation for all StateStore implementations
impl<T: StateStore + ?Sized> StateStoreExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_saga_state_prefix() {
        let id = SagaId::new();
        assert_eq!(state_key(id), format!("saga:state:{id}"));
    }

    #[test]
    fn ttl_is_one_day() {
        assert_eq!(DEFAULT_TTL.as_secs(), 86_400);
    }
}
