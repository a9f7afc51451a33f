//! HTTP API server for the user registration saga.
//!
//! Exposes saga start, status and step endpoints plus an event ingress for
//! collaborators, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemoryEventChannel, LoggingStepTrigger, SagaContext, SagaOrchestrator, StepTrigger,
    TimeoutManager,
};
use state_store::StateStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: StateStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route(
            "/api/v1/saga/user-registration",
            post(routes::sagas::start::<S>),
        )
        .route("/api/v1/saga/events", post(routes::sagas::ingest::<S>))
        .route("/api/v1/saga/{id}/status", get(routes::sagas::status::<S>))
        .route("/api/v1/saga/{id}/steps", get(routes::sagas::steps::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the saga engine around `store`, `channel` and `trigger`.
pub fn create_state<S: StateStore + 'static>(
    store: S,
    channel: InMemoryEventChannel,
    trigger: Arc<dyn StepTrigger>,
) -> Arc<AppState<S>> {
    let ctx = Arc::new(SagaContext::new(store, Arc::new(channel.clone())));
    let orchestrator = Arc::new(SagaOrchestrator::new(Arc::clone(&ctx), trigger));
    let timeouts = TimeoutManager::new(ctx);

    Arc::new(AppState {
        orchestrator,
        timeouts,
        channel,
    })
}

/// Creates the default application state: a channel with `partitions`
/// ordered queues and a trigger that only logs hand-offs.
pub fn create_default_state<S: StateStore + 'static>(
    store: S,
    partitions: usize,
) -> Arc<AppState<S>> {
    create_state(
        store,
        InMemoryEventChannel::new(partitions),
        Arc::new(LoggingStepTrigger),
    )
}
