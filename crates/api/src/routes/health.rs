//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use state_store::StateStore;

use super::sagas::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sagas: usize,
}

/// GET /health: liveness plus the number of sagas in progress.
pub async fn check<S: StateStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sagas: state.orchestrator.active_saga_ids().await.len(),
    })
}
