//! Ordered, partitioned transport for saga events.
//!
//! Events are keyed by saga id and every key hashes to exactly one partition,
//! so all events of one saga are consumed in publish order. There is no
//! ordering across partitions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::{self, SagaEvent};

/// Name of the single saga topic.
pub const SAGA_TOPIC: &str = "saga-events";

/// Partition count used when none is configured.
pub const DEFAULT_PARTITIONS: usize = 8;

/// Errors raised when publishing.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel no longer accepts messages.
    #[error("channel '{topic}' is closed: {reason}")]
    Closed { topic: String, reason: String },

    /// The event could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Publishing half of the saga event transport.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Serializes and enqueues an event keyed by its saga id.
    ///
    /// Never blocks on consumers.
    async fn publish(&self, event: &SagaEvent) -> Result<(), ChannelError>;
}

/// A serialized event as delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Message {
    pub key: String,
    pub partition: usize,
    /// Position within the partition, starting at zero.
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Returns the partition a key is routed to.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

struct Partition {
    sender: Option<mpsc::UnboundedSender<Message>>,
    receiver: Option<mpsc::UnboundedReceiver<Message>>,
    next_offset: u64,
}

struct ChannelState {
    partitions: Vec<Partition>,
    /// Only kept by channels built with [`InMemoryEventChannel::with_history`].
    history: Option<Vec<SagaEvent>>,
}

/// In-process implementation of [`EventChannel`] with one unbounded queue
/// per partition.
///
/// Each partition's receiver can be taken once by a consumer worker. A
/// channel built with [`with_history`](Self::with_history) also keeps every
/// published event for inspection; one built with [`new`](Self::new) keeps
/// nothing once consumed.
#[derive(Clone)]
pub struct InMemoryEventChannel {
    state: Arc<Mutex<ChannelState>>,
    fail_on_publish: Arc<AtomicBool>,
}

impl InMemoryEventChannel {
    /// Creates a channel with `partitions` ordered queues (at least one).
    pub fn new(partitions: usize) -> Self {
        Self::build(partitions, None)
    }

    /// Creates a channel that also records every published event.
    pub fn with_history(partitions: usize) -> Self {
        Self::build(partitions, Some(Vec::new()))
    }

    fn build(partitions: usize, history: Option<Vec<SagaEvent>>) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| {
                let (sender, receiver) = mpsc::unbounded_channel();
                Partition {
                    sender: Some(sender),
                    receiver: Some(receiver),
                    next_offset: 0,
                }
            })
            .collect();

        Self {
            state: Arc::new(Mutex::new(ChannelState {
                partitions,
                history,
            })),
            fail_on_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of partitions.
    pub fn partitions(&self) -> usize {
        self.lock().partitions.len()
    }

    /// Takes the receiver of one partition. Returns `None` if it was already
    /// taken or the partition does not exist.
    pub fn take_receiver(&self, partition: usize) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.lock()
            .partitions
            .get_mut(partition)
            .and_then(|p| p.receiver.take())
    }

    /// Takes every receiver that has not been taken yet.
    pub fn take_receivers(&self) -> Vec<(usize, mpsc::UnboundedReceiver<Message>)> {
        self.lock()
            .partitions
            .iter_mut()
            .enumerate()
            .filter_map(|(i, p)| p.receiver.take().map(|r| (i, r)))
            .collect()
    }

    /// Stops accepting events. Consumers drain what is queued and then end.
    pub fn close(&self) {
        for partition in self.lock().partitions.iter_mut() {
            partition.sender = None;
        }
    }

    /// Makes every publish fail until reset.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Every event published so far, in publish order. Always empty unless
    /// the channel records history.
    pub fn published(&self) -> Vec<SagaEvent> {
        self.lock().history.clone().unwrap_or_default()
    }

    /// Published events with the given `eventType`.
    pub fn published_of_type(&self, event_type: &str) -> Vec<SagaEvent> {
        self.lock()
            .history
            .iter()
            .flatten()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl std::fmt::Debug for InMemoryEventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventChannel")
            .field("partitions", &self.partitions())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    async fn publish(&self, event: &SagaEvent) -> Result<(), ChannelError> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed {
                topic: SAGA_TOPIC.to_string(),
                reason: "publishing disabled".to_string(),
            });
        }

        let key = event.partition_key();
        let payload = events::encode(event)?;

        let mut state = self.lock();
        let partition = partition_for(&key, state.partitions.len());
        let slot = &mut state.partitions[partition];
        let sender = slot.sender.as_ref().ok_or_else(|| ChannelError::Closed {
            topic: SAGA_TOPIC.to_string(),
            reason: "channel shut down".to_string(),
        })?;

        let message = Message {
            key,
            partition,
            offset: slot.next_offset,
            payload,
        };
        sender.send(message).map_err(|_| ChannelError::Closed {
            topic: SAGA_TOPIC.to_string(),
            reason: format!("partition {partition} has no consumer"),
        })?;
        slot.next_offset += 1;
        if let Some(history) = state.history.as_mut() {
            history.push(event.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventPayload, StepFailedData};
    use common::SagaId;

    fn event_for(saga_id: SagaId, message: &str) -> SagaEvent {
        SagaEvent::new(
            saga_id,
            "c",
            EventPayload::UserCreationFailed(StepFailedData {
                user_id: None,
                error_message: message.to_string(),
                error_code: None,
            }),
        )
    }

    #[test]
    fn test_partition_is_stable() {
        let key = SagaId::new().to_string();
        let p = partition_for(&key, 8);
        assert!(p < 8);
        assert_eq!(partition_for(&key, 8), p);
        assert_eq!(partition_for(&key, 0), 0);
    }

    #[tokio::test]
    async fn test_events_of_one_saga_stay_ordered() {
        let channel = InMemoryEventChannel::with_history(4);
        let saga_id = SagaId::new();
        for i in 0..5 {
            channel
                .publish(&event_for(saga_id, &i.to_string()))
                .await
                .unwrap();
        }

        let partition = partition_for(&saga_id.to_string(), 4);
        let mut rx = channel.take_receiver(partition).unwrap();
        for i in 0..5u64 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.offset, i);
            assert_eq!(message.key, saga_id.to_string());
            let event = events::decode(&message.payload).unwrap();
            assert_eq!(
                event.kind(),
                crate::events::EventKind::StepFailed {
                    step: crate::registration::STEP_CREATE_USER,
                    error_message: &i.to_string(),
                }
            );
        }
        assert_eq!(channel.published().len(), 5);
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let channel = InMemoryEventChannel::new(2);
        assert_eq!(channel.take_receivers().len(), 2);
        assert!(channel.take_receiver(0).is_none());
        assert!(channel.take_receiver(9).is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let channel = InMemoryEventChannel::with_history(1);
        channel.set_fail_on_publish(true);
        let err = channel
            .publish(&event_for(SagaId::new(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed { .. }));
        assert!(channel.published().is_empty());
    }

    #[tokio::test]
    async fn test_plain_channel_keeps_no_history() {
        let channel = InMemoryEventChannel::new(1);
        let mut rx = channel.take_receiver(0).unwrap();
        for i in 0..100 {
            channel
                .publish(&event_for(SagaId::new(), &i.to_string()))
                .await
                .unwrap();
        }

        assert!(channel.published().is_empty());
        assert!(channel.published_of_type(crate::events::USER_CREATION_FAILED).is_empty());
        for _ in 0..100 {
            assert!(rx.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_close_ends_consumers() {
        let channel = InMemoryEventChannel::new(1);
        let mut rx = channel.take_receiver(0).unwrap();
        channel.publish(&event_for(SagaId::new(), "x")).await.unwrap();
        channel.close();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert!(channel.publish(&event_for(SagaId::new(), "y")).await.is_err());
    }
}
