//! API server entry point.

use std::sync::Arc;
use std::time::Duration;

use api::config::Config;
use api::routes::sagas::AppState;
use saga::{SWEEP_INTERVAL, spawn_consumers};
use state_store::{InMemoryStateStore, PostgresStateStore, StateStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How often expired saga documents are removed.
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How long shutdown waits for in-flight step dispatches.
const DISPATCH_GRACE: Duration = Duration::from_secs(10);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn spawn_purge<S: StateStore + Clone + 'static>(store: S) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "expired sagas purged"),
                Err(e) => tracing::error!(error = %e, "failed to purge expired sagas"),
            }
        }
    })
}

async fn serve<S: StateStore + Clone + 'static>(store: S, config: &Config) {
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let state: Arc<AppState<S>> = api::create_default_state(store.clone(), config.partitions);

    // One ordered consumer per partition, plus the background sweepers.
    let consumers = spawn_consumers(Arc::clone(&state.orchestrator), &state.channel);
    let sweeper = state.timeouts.spawn(SWEEP_INTERVAL);
    let purge = spawn_purge(store);
    tracing::info!(
        partitions = consumers.len(),
        sweep_interval_secs = SWEEP_INTERVAL.as_secs(),
        "saga workers started"
    );

    let app = api::create_app(Arc::clone(&state), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    sweeper.abort();
    purge.abort();
    state.channel.close();
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::error!(error = %e, "consumer task failed");
        }
    }
    if tokio::time::timeout(DISPATCH_GRACE, state.orchestrator.settle())
        .await
        .is_err()
    {
        tracing::warn!("step dispatches still pending at shutdown");
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url)
                .await
                .expect("failed to connect to Postgres");
            let store = PostgresStateStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using Postgres state store");
            serve(store, &config).await;
        }
        None => {
            tracing::info!("using in-memory state store");
            serve(InMemoryStateStore::new(), &config).await;
        }
    }
}
