//! Saga submission, status and abort endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::InstanceId;
use event_store::{EventEnvelope, EventStore};
use saga::{SagaRepository, SagaStatusReport, StepExecutionRecord, SubmitSaga};
use serde::{Deserialize, Serialize};

use super::SharedState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct AbortRequest {
    pub reason: String,
    pub requested_by: String,
}

#[derive(Serialize)]
pub struct SubmittedResponse {
    pub instance_id: InstanceId,
}

#[derive(Serialize)]
pub struct AbortResponse {
    pub instance_id: InstanceId,
    pub status: &'static str,
}

fn parse_id(raw: &str) -> Result<InstanceId, ApiError> {
    InstanceId::parse(raw).map_err(|e| ApiError::BadRequest(format!("Invalid instance id: {e}")))
}

/// POST /sagas: the instance id is returned once its start is durable.
#[tracing::instrument(skip(state, request), fields(definition = %request.definition))]
pub async fn submit<S, R>(
    State(state): State<SharedState<S, R>>,
    Json(request): Json<SubmitSaga>,
) -> Result<(StatusCode, Json<SubmittedResponse>), ApiError>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    let instance_id = state.coordinator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmittedResponse { instance_id })))
}

/// GET /sagas/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S, R>(
    State(state): State<SharedState<S, R>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusReport>, ApiError>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    let instance_id = parse_id(&id)?;
    state
        .coordinator
        .status(instance_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Saga instance {instance_id} not found")))
}

/// GET /sagas/{id}/events
pub async fn events<S, R>(
    State(state): State<SharedState<S, R>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventEnvelope>>, ApiError>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    let instance_id = parse_id(&id)?;
    Ok(Json(state.coordinator.events(instance_id).await?))
}

/// GET /sagas/{id}/executions
pub async fn executions<S, R>(
    State(state): State<SharedState<S, R>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StepExecutionRecord>>, ApiError>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    let instance_id = parse_id(&id)?;
    Ok(Json(state.coordinator.executions(instance_id).await?))
}

/// POST /sagas/{id}/abort: accepted once the running driver has the signal.
#[tracing::instrument(skip(state, request))]
pub async fn abort<S, R>(
    State(state): State<SharedState<S, R>>,
    Path(id): Path<String>,
    Json(request): Json<AbortRequest>,
) -> Result<(StatusCode, Json<AbortResponse>), ApiError>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    let instance_id = parse_id(&id)?;
    state
        .coordinator
        .abort(instance_id, request.reason, request.requested_by)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AbortResponse {
            instance_id,
            status: "abort_requested",
        }),
    ))
}
