//! Registered saga definitions.

use axum::Json;
use axum::extract::State;
use event_store::EventStore;
use saga::{SagaDefinition, SagaRepository};
use serde::Serialize;

use super::SharedState;

#[derive(Serialize)]
pub struct DefinitionResponse {
    pub name: String,
    pub steps: Vec<StepResponse>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub name: String,
    pub timeout_ms: u128,
    pub max_retries: usize,
    pub compensable: bool,
}

impl From<&SagaDefinition> for DefinitionResponse {
    fn from(definition: &SagaDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            steps: definition
                .steps
                .iter()
                .map(|step| StepResponse {
                    name: step.name.clone(),
                    timeout_ms: step.timeout.as_millis(),
                    max_retries: step.retry.max_retries,
                    compensable: step.compensation.is_some(),
                })
                .collect(),
        }
    }
}

/// GET /definitions
pub async fn list<S, R>(State(state): State<SharedState<S, R>>) -> Json<Vec<DefinitionResponse>>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    Json(
        state
            .coordinator
            .definitions()
            .iter()
            .map(|d| DefinitionResponse::from(d.as_ref()))
            .collect(),
    )
}
