//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use event_store::EventStore;
use saga::SagaRepository;
use serde::Serialize;

use super::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_instances: usize,
    pub armed_timeouts: usize,
}

/// GET /health: liveness plus the coordinator's in-process load.
pub async fn check<S, R>(State(state): State<SharedState<S, R>>) -> Json<HealthResponse>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    Json(HealthResponse {
        status: "ok",
        active_instances: state.coordinator.active_instances().len(),
        armed_timeouts: state.coordinator.armed_timeouts(),
    })
}
