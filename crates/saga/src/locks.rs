//! Per-saga serialization of read-modify-write cycles.

use std::collections::HashMap;
use std::sync::Arc;

use common::SagaId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per saga id.
///
/// The event consumer, the retry manager and the timeout manager all take
/// the saga's lock before loading its state and hold it until the write is
/// done. Whoever acquires the lock first wins a race.
#[derive(Debug, Default, Clone)]
pub struct SagaLocks {
    inner: Arc<Mutex<HashMap<SagaId, Arc<Mutex<()>>>>>,
}

impl SagaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `saga_id`.
    pub async fn acquire(&self, saga_id: SagaId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(saga_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops locks nobody holds or waits on.
    pub async fn prune(&self) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - map.len()
    }

    /// Number of tracked saga locks.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_saga_is_serialized() {
        let locks = SagaLocks::new();
        let id = SagaId::new();

        let guard = locks.acquire(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_sagas_do_not_block() {
        let locks = SagaLocks::new();
        let _a = locks.acquire(SagaId::new()).await;
        let _b = locks.acquire(SagaId::new()).await;
        assert_eq!(locks.len().await, 2);
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = SagaLocks::new();
        let held = locks.acquire(SagaId::new()).await;
        drop(locks.acquire(SagaId::new()).await);

        assert_eq!(locks.prune().await, 1);
        assert_eq!(locks.len().await, 1);
        drop(held);
        assert_eq!(locks.prune().await, 1);
        assert!(locks.is_empty().await);
    }
}
