use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use saga::events::{AlertSetupCompletedData, EventPayload, NotificationSentData, UserCreatedData};
use saga::{
    InMemoryEventChannel, InMemoryStepTrigger, SagaContext, SagaEvent, SagaOrchestrator,
};
use state_store::InMemoryStateStore;

fn orchestrator() -> SagaOrchestrator<InMemoryStateStore> {
    let ctx = Arc::new(SagaContext::new(
        InMemoryStateStore::new(),
        Arc::new(InMemoryEventChannel::new(8)),
    ));
    SagaOrchestrator::new(ctx, Arc::new(InMemoryStepTrigger::new()))
}

fn bench_start_saga(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = orchestrator();

    c.bench_function("saga/start", |b| {
        b.iter(|| {
            rt.block_on(async {
                orchestrator.start_saga("bench".to_string()).await.unwrap();
            });
        });
    });
}

fn bench_full_registration(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = orchestrator();

    c.bench_function("saga/full_registration", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = orchestrator.start_saga("bench".to_string()).await.unwrap();
                let events = [
                    EventPayload::UserCreated(UserCreatedData {
                        user_id: "u".to_string(),
                        phone_number: "+15550100".to_string(),
                        data_plan_limit: 1024,
                        current_usage: 0,
                    }),
                    EventPayload::AlertSetupCompleted(AlertSetupCompletedData {
                        user_id: "u".to_string(),
                        alert_id: "a".to_string(),
                        threshold_percent: 80.0,
                        alert_enabled: true,
                    }),
                    EventPayload::NotificationSent(NotificationSentData {
                        user_id: "u".to_string(),
                        notification_id: "n".to_string(),
                        notification_type: "WELCOME".to_string(),
                        recipient: "+15550100".to_string(),
                        success: true,
                    }),
                ];
                for payload in events {
                    orchestrator
                        .handle_event(SagaEvent::new(id, "bench", payload))
                        .await
                        .unwrap();
                }
                orchestrator.settle().await;
            });
        });
    });
}

criterion_group!(benches, bench_start_saga, bench_full_registration);
criterion_main!(benches);
