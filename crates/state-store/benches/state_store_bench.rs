use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use state_store::{InMemoryStateStore, SagaId, StateStore, Version};

fn bench_save_new(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("state_store/save_new", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStateStore::new();
                store
                    .save(SagaId::new(), json!({"status": "PENDING"}), Version::initial())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_read_modify_write(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStateStore::new();
    let id = SagaId::new();
    rt.block_on(async {
        store.save(id, json!({"n": 0}), Version::initial()).await.unwrap();
    });

    c.bench_function("state_store/read_modify_write", |b| {
        b.iter(|| {
            rt.block_on(async {
                let record = store.get(id).await.unwrap().unwrap();
                store
                    .save(id, record.payload, record.version)
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_save_new, bench_read_modify_write);
criterion_main!(benches);
