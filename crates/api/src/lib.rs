//! HTTP API server for the saga coordinator.
//!
//! Exposes the submission and status APIs over REST, with structured
//! logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{DefinitionDocument, SagaCoordinator, SagaRepository};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, R>(coordinator: SagaCoordinator<S, R>, metrics_handle: PrometheusHandle) -> Router
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    let state = Arc::new(AppState { coordinator });

    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S, R>))
        .route("/definitions", get(routes::definitions::list::<S, R>))
        .route("/sagas", post(routes::sagas::submit::<S, R>))
        .route("/sagas/{id}", get(routes::sagas::get::<S, R>))
        .route("/sagas/{id}/events", get(routes::sagas::events::<S, R>))
        .route("/sagas/{id}/executions", get(routes::sagas::executions::<S, R>))
        .route("/sagas/{id}/abort", post(routes::sagas::abort::<S, R>))
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

/// Resolves HTTP definitions and registers them with the coordinator.
pub fn register_documents<S, R>(
    coordinator: &SagaCoordinator<S, R>,
    documents: &[DefinitionDocument],
    client: &reqwest::Client,
) -> saga::Result<usize>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    for document in documents {
        coordinator.register_definition(document.resolve(client)?)?;
    }
    Ok(documents.len())
}
