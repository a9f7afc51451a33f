//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p state-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use state_store::{PostgresStateStore, SagaId, StateStore, StateStoreError, Version};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_state_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresStateStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_state")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStateStore::new(pool)
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_save_get_roundtrip() {
    let store = get_test_store().await;
    let id = SagaId::new();

    let v1 = store
        .save(id, json!({"status": "PENDING"}), Version::initial())
        .await
        .unwrap();
    assert_eq!(v1, Version::new(1));

    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.saga_id, id);
    assert_eq!(record.version, v1);
    assert_eq!(record.payload["status"], "PENDING");
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_optimistic_concurrency() {
    let store = get_test_store().await;
    let id = SagaId::new();

    store.save(id, json!({}), Version::initial()).await.unwrap();
    store.save(id, json!({"n": 2}), Version::new(1)).await.unwrap();

    let err = store
        .save(id, json!({"n": 3}), Version::new(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StateStoreError::ConcurrencyConflict { actual, .. } if actual == Version::new(2)
    ));

    let err = store
        .save(id, json!({}), Version::initial())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_exists_delete_and_extend() {
    let store = get_test_store().await;
    let id = SagaId::new();

    assert!(!store.exists(id).await.unwrap());
    assert!(!store.extend_ttl(id).await.unwrap());

    store.save(id, json!({}), Version::initial()).await.unwrap();
    assert!(store.exists(id).await.unwrap());
    assert!(store.extend_ttl(id).await.unwrap());

    assert!(store.delete(id).await.unwrap());
    assert!(!store.exists(id).await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_expired_rows_are_invisible_and_purged() {
    let store = get_test_store().await.with_ttl(Duration::from_secs(1));
    let id = SagaId::new();

    store.save(id, json!({}), Version::initial()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(store.get(id).await.unwrap().is_none());
    assert_eq!(store.purge_expired().await.unwrap(), 1);

    // The key is free again once expired.
    let version = store.save(id, json!({}), Version::initial()).await.unwrap();
    assert_eq!(version, Version::new(1));
}
