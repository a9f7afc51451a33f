//! Consumer workers feeding the saga channel into the orchestrator.

use std::sync::Arc;

use state_store::StateStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{InMemoryEventChannel, Message};
use crate::error::SagaError;
use crate::events;
use crate::orchestrator::{EventOutcome, SagaOrchestrator};

/// Decodes one message and applies it.
///
/// Never fails: undecodable messages and events for unknown sagas are
/// logged, counted and dropped. Returns the outcome when the event was
/// applied.
pub async fn process_message<S: StateStore + 'static>(
    orchestrator: &SagaOrchestrator<S>,
    message: &Message,
) -> Option<EventOutcome> {
    let event = match events::decode(&message.payload) {
        Ok(event) => event,
        Err(e) => {
            metrics::counter!("saga_events_dropped_total", "reason" => e.reason()).increment(1);
            tracing::warn!(
                key = %message.key,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "dropping undecodable message"
            );
            return None;
        }
    };

    let saga_id = event.saga_id;
    let event_type = event.event_type();
    match orchestrator.handle_event(event).await {
        Ok(outcome) => {
            tracing::debug!(%saga_id, event_type, ?outcome, "event handled");
            Some(outcome)
        }
        Err(SagaError::UnknownSaga(_)) => {
            metrics::counter!("saga_events_dropped_total", "reason" => "unknown_saga").increment(1);
            tracing::warn!(%saga_id, event_type, "event for unknown saga dropped");
            None
        }
        Err(e) if e.is_persistence() => {
            // Already logged and counted where the write failed.
            tracing::warn!(%saga_id, event_type, error = %e, "event applied but not persisted");
            None
        }
        Err(e) => {
            metrics::counter!("saga_events_dropped_total", "reason" => "rejected").increment(1);
            tracing::error!(%saga_id, event_type, error = %e, "event rejected");
            None
        }
    }
}

/// Consumes one partition in order until the channel closes.
pub async fn run_partition<S: StateStore + 'static>(
    orchestrator: Arc<SagaOrchestrator<S>>,
    partition: usize,
    mut receiver: mpsc::UnboundedReceiver<Message>,
) {
    tracing::info!(partition, "saga consumer started");
    while let Some(message) = receiver.recv().await {
        process_message(&orchestrator, &message).await;
    }
    tracing::info!(partition, "saga consumer stopped");
}

/// Spawns one worker per untaken partition of `channel`.
pub fn spawn_consumers<S: StateStore + 'static>(
    orchestrator: Arc<SagaOrchestrator<S>>,
    channel: &InMemoryEventChannel,
) -> Vec<JoinHandle<()>> {
    channel
        .take_receivers()
        .into_iter()
        .map(|(partition, receiver)| {
            tokio::spawn(run_partition(Arc::clone(&orchestrator), partition, receiver))
        })
        .collect()
}
