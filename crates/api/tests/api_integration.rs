//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{InMemoryEventChannel, InMemoryStepTrigger, SagaEvent, SagaStatus, process_message};
use state_store::InMemoryStateStore;
use tower::ServiceExt;

use api::routes::sagas::AppState;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, Arc<AppState<InMemoryStateStore>>) {
    let state = api::create_state(
        InMemoryStateStore::new(),
        InMemoryEventChannel::with_history(2),
        Arc::new(InMemoryStepTrigger::new()),
    );
    let app = api::create_app(Arc::clone(&state), get_metrics_handle());
    (app, state)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn start_saga(app: &axum::Router) -> String {
    let (status, json) = send(
        app,
        post_json(
            "/api/v1/saga/user-registration",
            serde_json::json!({ "correlationId": "corr-1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json["sagaId"].as_str().unwrap().to_string()
}

/// Applies everything queued on the channel, as the consumer workers would.
async fn drain(state: &AppState<InMemoryStateStore>) {
    for (_, mut receiver) in state.channel.take_receivers() {
        while let Ok(message) = receiver.try_recv() {
            process_message(&state.orchestrator, &message).await;
        }
    }
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();
    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["activeSagas"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();
    start_saga(&app).await;

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_start_saga() {
    let (app, _) = setup();
    let (status, json) = send(
        &app,
        post_json(
            "/api/v1/saga/user-registration",
            serde_json::json!({ "correlationId": "corr-1" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["correlationId"], "corr-1");
    assert_eq!(json["status"], "STARTED");
    assert!(json["sagaId"].as_str().unwrap().parse::<common::SagaId>().is_ok());
}

#[tokio::test]
async fn test_start_saga_without_body_generates_correlation_id() {
    let (app, _) = setup();
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/saga/user-registration")
        .body(Body::empty())
        .unwrap();

    let (status, json) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!json["correlationId"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_saga_status_and_steps() {
    let (app, _) = setup();
    let saga_id = start_saga(&app).await;

    let (status, json) = send(&app, get(&format!("/api/v1/saga/{saga_id}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["sagaId"], saga_id);
    assert_eq!(json["status"], "IN_PROGRESS");
    assert_eq!(json["correlationId"], "corr-1");
    assert_eq!(json["steps"].as_array().unwrap().len(), 3);

    let (status, json) = send(&app, get(&format!("/api/v1/saga/{saga_id}/steps"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["currentStep"], "CREATE_USER");
    assert_eq!(json["compensationRequired"], false);
    assert_eq!(json["steps"][0]["status"], "IN_PROGRESS");
    assert_eq!(json["steps"][1]["status"], "PENDING");
}

#[tokio::test]
async fn test_unknown_saga_is_404() {
    let (app, _) = setup();
    let id = common::SagaId::new();
    let (status, json) = send(&app, get(&format!("/api/v1/saga/{id}/status"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("not found"));

    let (status, _) = send(&app, get(&format!("/api/v1/saga/{id}/steps"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_saga_id_is_400() {
    let (app, _) = setup();
    let (status, _) = send(&app, get("/api/v1/saga/not-a-uuid/status")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ingested_events_drive_the_saga() {
    let (app, state) = setup();
    let saga_id = start_saga(&app).await;

    let (status, json) = send(
        &app,
        post_json(
            "/api/v1/saga/events",
            serde_json::json!({
                "sagaId": saga_id,
                "eventId": common::EventId::new().to_string(),
                "timestamp": "2024-05-01T10:00:00Z",
                "correlationId": "corr-1",
                "eventType": "USER_CREATED",
                "userId": "user-1",
                "phoneNumber": "+15550100",
                "dataPlanLimit": 10240,
                "currentUsage": 0
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["eventType"], "USER_CREATED");

    drain(&state).await;

    let (_, json) = send(&app, get(&format!("/api/v1/saga/{saga_id}/steps"))).await;
    assert_eq!(json["steps"][0]["status"], "COMPLETED");
    assert_eq!(json["currentStep"], "SETUP_ALERTS");
}

#[tokio::test]
async fn test_failure_event_compensates_through_the_channel() {
    let (app, state) = setup();
    let saga_id = start_saga(&app).await;
    let id: common::SagaId = saga_id.parse().unwrap();

    for body in [
        serde_json::json!({
            "sagaId": saga_id, "eventId": common::EventId::new().to_string(),
            "timestamp": "2024-05-01T10:00:00Z", "correlationId": "corr-1",
            "eventType": "USER_CREATED", "userId": "u", "phoneNumber": "p",
            "dataPlanLimit": 1, "currentUsage": 0
        }),
        serde_json::json!({
            "sagaId": saga_id, "eventId": common::EventId::new().to_string(),
            "timestamp": "2024-05-01T10:00:01Z", "correlationId": "corr-1",
            "eventType": "ALERT_SETUP_FAILED", "userId": "u",
            "errorMessage": "x", "errorCode": "ALERT_SETUP_ERROR"
        }),
    ] {
        let (status, _) = send(&app, post_json("/api/v1/saga/events", body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    // First pass applies the ingested events and publishes the compensation
    // request; the second applies that request as the acknowledgment.
    let mut receivers = state.channel.take_receivers();
    for _ in 0..2 {
        for (_, receiver) in receivers.iter_mut() {
            while let Ok(message) = receiver.try_recv() {
                process_message(&state.orchestrator, &message).await;
            }
        }
    }

    let compensations: Vec<SagaEvent> =
        state.channel.published_of_type(saga::events::SAGA_COMPENSATION);
    assert_eq!(compensations.len(), 1);
    let saga = state.orchestrator.get_saga_state(id).await.unwrap().unwrap();
    assert_eq!(saga.status(), SagaStatus::Compensated);
}

#[tokio::test]
async fn test_ingest_rejects_bad_payloads() {
    let (app, _) = setup();

    let (status, _) = send(
        &app,
        post_json(
            "/api/v1/saga/events",
            serde_json::json!({
                "sagaId": common::SagaId::new().to_string(),
                "eventId": common::EventId::new().to_string(),
                "timestamp": "2024-05-01T10:00:00Z",
                "correlationId": "c",
                "eventType": "USER_DELETED"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/saga/events")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
