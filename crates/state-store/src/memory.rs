use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{
    Result, SagaId, StateRecord, StateStoreError, Version,
    store::{DEFAULT_TTL, StateStore, state_key},
};

#[derive(Debug, Clone)]
struct Entry {
    saga_id: SagaId,
    version: Version,
    payload: serde_json::Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory state store with per-key expiry.
///
/// Expiry is measured on the tokio clock, so tests running with paused time
/// can observe TTL behavior without waiting.
#[derive(Clone)]
pub struct InMemoryStateStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: Duration,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

impl InMemoryStateStore {
    /// Creates a new empty store with the default 24 hour TTL.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty store with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Returns the number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Returns true if there are no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the keys of all live entries.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<_> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Clears all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(
        &self,
        saga_id: SagaId,
        payload: serde_json::Value,
        expected: Version,
    ) -> Result<Version> {
        let key = state_key(saga_id);
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let current = entries
            .get(&key)
            .filter(|e| e.is_live(now))
            .map(|e| e.version)
            .unwrap_or(Version::initial());

        if current != expected {
            return Err(StateStoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current,
            });
        }

        let version = current.next();
        entries.insert(
            key,
            Entry {
                saga_id,
                version,
                payload,
                expires_at: now + self.ttl,
            },
        );
        tracing::debug!(%saga_id, %version, "saved saga state");

        Ok(version)
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<StateRecord>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(&state_key(saga_id))
            .filter(|e| e.is_live(now))
            .map(|e| StateRecord {
                saga_id: e.saga_id,
                version: e.version,
                payload: e.payload.clone(),
            }))
    }

    async fn delete(&self, saga_id: SagaId) -> Result<bool> {
        let now = Instant::now();
        let removed = self.entries.write().await.remove(&state_key(saga_id));
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(&state_key(saga_id))
            .is_some_and(|e| e.is_live(now)))
    }

    async fn extend_ttl(&self, saga_id: SagaId) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(&state_key(saga_id)) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now + self.ttl;
                tracing::debug!(%saga_id, "extended saga state TTL");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok((before - entries.len()) as u64)
    }
}
