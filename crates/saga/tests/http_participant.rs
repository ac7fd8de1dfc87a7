//! HTTP participants against a local axum server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use common::InstanceId;
use event_store::InMemoryEventStore;
use saga::{
    CoordinatorConfig, DefinitionDocument, Direction, HttpOperation, InMemorySagaRepository,
    Operation, ParticipantCall, ParticipantError, SagaCoordinator, SagaStatus, StepDocument,
    SubmitSaga,
};
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct Participant {
    calls: Arc<Mutex<Vec<(String, String, Value)>>>,
    flaky_failures: Arc<Mutex<u32>>,
}

impl Participant {
    fn calls_to(&self, route: &str) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| r == route)
            .map(|(_, key, body)| (key.clone(), body.clone()))
            .collect()
    }
}

async fn handle(
    State(participant): State<Participant>,
    Path(route): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    participant
        .calls
        .lock()
        .unwrap()
        .push((route.clone(), key, body));

    match route.as_str() {
        "create" => Json(json!({"base_id": "app123"})).into_response(),
        "sync" => Json(json!({"synced": 42})).into_response(),
        "empty" | "undo" => StatusCode::NO_CONTENT.into_response(),
        "reject" => (StatusCode::UNPROCESSABLE_ENTITY, "invalid workspace").into_response(),
        "flaky" => {
            let mut remaining = participant.flaky_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            } else {
                Json(json!({"flaky": "ok"})).into_response()
            }
        }
        "garbage" => (StatusCode::OK, "not json").into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve(participant: Participant) -> String {
    let app = Router::new()
        .route("/{route}", post(handle))
        .with_state(participant);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn call(direction: Direction) -> ParticipantCall {
    let instance_id = InstanceId::new();
    ParticipantCall {
        instance_id,
        correlation_id: "corr-1".to_string(),
        step_name: "create_base".to_string(),
        direction,
        attempt_number: 1,
        idempotency_key: ParticipantCall::idempotency_key_for(
            instance_id,
            "create_base",
            direction,
        ),
        context: json!({"workspace": "acme"}).as_object().cloned().unwrap(),
    }
}

#[tokio::test]
async fn test_success_returns_json_body() {
    let participant = Participant::default();
    let base = serve(participant.clone()).await;
    let op = HttpOperation::new("create", format!("{base}/create"), reqwest::Client::new());

    let call = call(Direction::Forward);
    let output = op.invoke(&call).await.unwrap();

    assert_eq!(output, Some(json!({"base_id": "app123"})));
    let calls = participant.calls_to("create");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, call.idempotency_key);
    assert_eq!(calls[0].1["step_name"], "create_base");
    assert_eq!(calls[0].1["attempt_number"], 1);
    assert_eq!(calls[0].1["context"]["workspace"], "acme");
}

#[tokio::test]
async fn test_empty_body_is_no_output() {
    let base = serve(Participant::default()).await;
    let op = HttpOperation::new("empty", format!("{base}/empty"), reqwest::Client::new());

    assert_eq!(op.invoke(&call(Direction::Forward)).await.unwrap(), None);
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let base = serve(Participant::default()).await;
    let op = HttpOperation::new("reject", format!("{base}/reject"), reqwest::Client::new());

    let err = op.invoke(&call(Direction::Forward)).await.unwrap_err();
    assert_eq!(
        err,
        ParticipantError::Status {
            code: 422,
            message: "invalid workspace".to_string()
        }
    );
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let base = serve(Participant::default()).await;
    let op = HttpOperation::new("garbage", format!("{base}/garbage"), reqwest::Client::new());

    let err = op.invoke(&call(Direction::Forward)).await.unwrap_err();
    assert!(matches!(err, ParticipantError::Rejected(_)));
}

#[tokio::test]
async fn test_unreachable_participant_is_network_error() {
    let op = HttpOperation::new("down", "http://127.0.0.1:1/down", reqwest::Client::new());

    let err = op.invoke(&call(Direction::Forward)).await.unwrap_err();
    assert!(matches!(err, ParticipantError::Network(_)));
}

fn step(base: &str, name: &str, forward: &str, compensation: Option<&str>) -> StepDocument {
    StepDocument {
        name: name.to_string(),
        forward_url: format!("{base}/{forward}"),
        compensation_url: compensation.map(|route| format!("{base}/{route}")),
        timeout_ms: 5_000,
        max_retries: Some(3),
        min_delay_ms: Some(1),
        max_delay_ms: Some(10),
        side_effects_on_failure: false,
    }
}

fn coordinator() -> SagaCoordinator<InMemoryEventStore, InMemorySagaRepository> {
    SagaCoordinator::new(
        InMemoryEventStore::new(),
        InMemorySagaRepository::new(),
        CoordinatorConfig::default().with_call_timeout(Duration::from_secs(2)),
    )
}

#[tokio::test]
async fn test_saga_over_http_merges_outputs() {
    let participant = Participant::default();
    *participant.flaky_failures.lock().unwrap() = 2;
    let base = serve(participant.clone()).await;

    let document = DefinitionDocument {
        name: "provision".to_string(),
        steps: vec![
            step(&base, "create_base", "create", Some("undo")),
            step(&base, "warm_cache", "flaky", None),
            step(&base, "sync_records", "sync", Some("undo")),
        ],
    };
    let coordinator = coordinator();
    coordinator
        .register_definition(document.resolve(&reqwest::Client::new()).unwrap())
        .unwrap();

    let id = coordinator
        .submit(SubmitSaga::new("provision", "ops@example.com"))
        .await
        .unwrap();
    assert_eq!(
        coordinator.wait_for_terminal(id).await.unwrap(),
        SagaStatus::Completed
    );

    let report = coordinator.status(id).await.unwrap().unwrap();
    assert_eq!(report.context["base_id"], "app123");
    assert_eq!(report.context["synced"], 42);

    // Later steps see earlier outputs
    let sync_calls = participant.calls_to("sync");
    assert_eq!(sync_calls[0].1["context"]["base_id"], "app123");

    // Retries reuse the idempotency key
    let flaky = participant.calls_to("flaky");
    assert_eq!(flaky.len(), 3);
    assert!(flaky.iter().all(|(key, _)| key == &flaky[0].0));
    let attempts: Vec<_> = flaky.iter().map(|(_, body)| body["attempt_number"].clone()).collect();
    assert_eq!(attempts, [json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_rejection_over_http_calls_compensation() {
    let participant = Participant::default();
    let base = serve(participant.clone()).await;

    let document = DefinitionDocument {
        name: "provision".to_string(),
        steps: vec![
            step(&base, "create_base", "create", Some("undo")),
            step(&base, "sync_records", "reject", Some("undo")),
        ],
    };
    let coordinator = coordinator();
    coordinator
        .register_definition(document.resolve(&reqwest::Client::new()).unwrap())
        .unwrap();

    let id = coordinator
        .submit(SubmitSaga::new("provision", "ops@example.com"))
        .await
        .unwrap();
    assert_eq!(
        coordinator.wait_for_terminal(id).await.unwrap(),
        SagaStatus::Compensated
    );

    // 422 is permanent: no retries
    assert_eq!(participant.calls_to("reject").len(), 1);
    let undo = participant.calls_to("undo");
    assert_eq!(undo.len(), 1);
    assert_eq!(undo[0].1["step_name"], "create_base");
    assert_eq!(undo[0].1["direction"], "Compensate");
    assert_eq!(undo[0].0, format!("{id}:create_base:compensate"));
}
