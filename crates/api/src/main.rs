//! API server entry point.

use api::config::{Config, LogFormat};
use event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    DefinitionDocument, InMemorySagaRepository, PostgresSagaRepository, SagaCoordinator,
    SagaRepository,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

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

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Registers definitions, resumes unfinished instances and serves until shutdown.
async fn run<S, R>(
    config: Config,
    coordinator: SagaCoordinator<S, R>,
    documents: Vec<DefinitionDocument>,
    metrics_handle: PrometheusHandle,
) where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    let client = reqwest::Client::new();
    let registered = api::register_documents(&coordinator, &documents, &client)
        .expect("invalid saga definition");
    tracing::info!(registered, "saga definitions loaded");

    let report = coordinator.recover().await.expect("recovery failed");
    tracing::info!(
        scanned = report.scanned,
        resumed = report.resumed,
        skipped = report.skipped,
        "recovery finished"
    );

    let sweeper = coordinator.spawn_timeout_sweeper();
    let app = api::create_app(coordinator, metrics_handle);

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
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Read saga definitions
    let documents = config
        .load_definitions()
        .expect("failed to load saga definitions");

    // 4. Pick the storage backend and run
    let coordinator_config = config.coordinator.clone();
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to Postgres");
            let store = PostgresEventStore::new(pool.clone());
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            let repository = PostgresSagaRepository::new(pool);
            let coordinator = SagaCoordinator::new(store, repository, coordinator_config);
            run(config, coordinator, documents, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            let coordinator = SagaCoordinator::new(
                InMemoryEventStore::new(),
                InMemorySagaRepository::new(),
                coordinator_config,
            );
            run(config, coordinator, documents, metrics_handle).await;
        }
    }
}
