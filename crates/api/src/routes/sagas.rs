//! Saga start, status and event ingress endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::SagaId;
use saga::{
    EventChannel, InMemoryEventChannel, SagaOrchestrator, SagaState, SagaStatus, SagaStep,
    TimeoutManager, events,
};
use serde::{Deserialize, Serialize};
use state_store::StateStore;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub orchestrator: Arc<SagaOrchestrator<S>>,
    pub timeouts: TimeoutManager<S>,
    pub channel: InMemoryEventChannel,
}

// -- Request types --

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSagaRequest {
    pub correlation_id: Option<String>,
}

// -- Response types --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStartedResponse {
    pub saga_id: String,
    pub correlation_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStepsResponse {
    pub saga_id: String,
    pub status: SagaStatus,
    pub steps: Vec<SagaStep>,
    pub current_step: Option<String>,
    pub compensation_required: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAcceptedResponse {
    pub event_id: String,
    pub saga_id: String,
    pub event_type: &'static str,
}

fn parse_saga_id(raw: &str) -> Result<SagaId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}

async fn load<S: StateStore + 'static>(
    state: &AppState<S>,
    saga_id: SagaId,
) -> Result<SagaState, ApiError> {
    state
        .orchestrator
        .get_saga_state(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {saga_id} not found")))
}

// -- Handlers --

/// POST /api/v1/saga/user-registration: start a registration saga.
///
/// The body is optional; a missing correlation id is generated.
#[tracing::instrument(skip(state, body))]
pub async fn start<S: StateStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<Json<SagaStartedResponse>, ApiError> {
    let request: StartSagaRequest = if body.is_empty() {
        StartSagaRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?
    };
    let correlation_id = request
        .correlation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let saga_id = state.orchestrator.start_saga(correlation_id.clone()).await?;
    // Backs up the periodic sweep with a check right at the deadline.
    drop(state.timeouts.schedule_saga_timeout(saga_id));

    Ok(Json(SagaStartedResponse {
        saga_id: saga_id.to_string(),
        correlation_id,
        status: "STARTED",
    }))
}

/// GET /api/v1/saga/{id}/status: the full saga state.
pub async fn status<S: StateStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaState>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(load(&state, saga_id).await?))
}

/// GET /api/v1/saga/{id}/steps: step progress only.
pub async fn steps<S: StateStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStepsResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let saga = load(&state, saga_id).await?;

    Ok(Json(SagaStepsResponse {
        saga_id: saga_id.to_string(),
        status: saga.status(),
        steps: saga.steps().to_vec(),
        current_step: saga.current_step().map(str::to_string),
        compensation_required: saga.compensation_required(),
    }))
}

/// POST /api/v1/saga/events: publish a collaborator's result event.
#[tracing::instrument(skip(state, body))]
pub async fn ingest<S: StateStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventAcceptedResponse>), ApiError> {
    let event = events::decode(&body)?;
    state
        .channel
        .publish(&event)
        .await
        .map_err(saga::SagaError::from)?;

    tracing::info!(saga_id = %event.saga_id, event_type = event.event_type(), "event accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(EventAcceptedResponse {
            event_id: event.event_id.to_string(),
            saga_id: event.saga_id.to_string(),
            event_type: event.event_type(),
        }),
    ))
}
