//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and truncate the tables
//! between tests, so they run serially. They need Docker:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --ignored
//! ```

use std::sync::Arc;

use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, EventStoreExt, InstanceId,
    PostgresEventStore, SequenceNumber, Snapshot,
};
use futures_util::StreamExt;
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresEventStore::new(pool.clone())
                .run_migrations()
                .await
                .unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE event_store, saga_snapshots")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn create_test_event(
    instance_id: InstanceId,
    sequence: SequenceNumber,
    event_type: &str,
) -> EventEnvelope {
    EventEnvelope::builder()
        .instance_id(instance_id)
        .sequence(sequence)
        .event_type(event_type)
        .payload_raw(serde_json::json!({"test": true}))
        .metadata("correlation_id", serde_json::json!("corr-1"))
        .build()
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn append_and_replay_events() {
    let store = get_test_store().await;
    let id = InstanceId::new();

    let events = vec![
        create_test_event(id, SequenceNumber::new(1), "SagaStarted"),
        create_test_event(id, SequenceNumber::new(2), "StepStarted"),
        create_test_event(id, SequenceNumber::new(3), "StepCompleted"),
    ];
    let last = store
        .append(events, AppendOptions::expect_new())
        .await
        .unwrap();
    assert_eq!(last, SequenceNumber::new(3));

    let stored = store.load_events(id).await.unwrap();
    let types: Vec<_> = stored.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, ["SagaStarted", "StepStarted", "StepCompleted"]);
    assert_eq!(stored[0].metadata_str("correlation_id"), Some("corr-1"));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn stale_expected_sequence_is_rejected() {
    let store = get_test_store().await;
    let id = InstanceId::new();

    store
        .append_event(
            create_test_event(id, SequenceNumber::first(), "SagaStarted"),
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    let result = store
        .append_event(
            create_test_event(id, SequenceNumber::new(2), "StepStarted"),
            AppendOptions::expect_new(),
        )
        .await;
    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn duplicate_sequence_hits_unique_constraint() {
    let store = get_test_store().await;
    let id = InstanceId::new();

    store
        .append_event(
            create_test_event(id, SequenceNumber::first(), "SagaStarted"),
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let result = store
        .append_event(
            create_test_event(id, SequenceNumber::first(), "SagaStarted"),
            AppendOptions::new(),
        )
        .await;
    assert!(matches!(
        result,
        Err(EventStoreError::ConcurrencyConflict { .. })
    ));
    assert_eq!(store.load_events(id).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn load_events_from_sequence() {
    let store = get_test_store().await;
    let id = InstanceId::new();

    let events = (1..=4)
        .map(|s| create_test_event(id, SequenceNumber::new(s), "StepStarted"))
        .collect();
    store.append(events, AppendOptions::new()).await.unwrap();

    let tail = store
        .load_events_from(id, SequenceNumber::new(3))
        .await
        .unwrap();
    let sequences: Vec<_> = tail.iter().map(|e| e.sequence.as_i64()).collect();
    assert_eq!(sequences, [3, 4]);
    assert_eq!(
        store.last_sequence(id).await.unwrap(),
        Some(SequenceNumber::new(4))
    );
    assert_eq!(store.last_sequence(InstanceId::new()).await.unwrap(), None);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn snapshot_is_replaced_and_bounds_replay() {
    let store = get_test_store().await;
    let id = InstanceId::new();

    let events = (1..=5)
        .map(|s| create_test_event(id, SequenceNumber::new(s), "StepStarted"))
        .collect();
    store.append(events, AppendOptions::new()).await.unwrap();

    let first = Snapshot::from_state(id, SequenceNumber::new(2), &serde_json::json!({"n": 2}))
        .unwrap();
    store.save_snapshot(first).await.unwrap();
    let second = Snapshot::from_state(id, SequenceNumber::new(4), &serde_json::json!({"n": 4}))
        .unwrap();
    store.save_snapshot(second).await.unwrap();

    let (snapshot, tail) = store.load_stream(id).await.unwrap();
    let snapshot = snapshot.unwrap();
    assert_eq!(snapshot.sequence, SequenceNumber::new(4));
    assert_eq!(snapshot.state["n"], 4);
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].sequence, SequenceNumber::new(5));
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn stream_all_events_in_insertion_order() {
    let store = get_test_store().await;
    let a = InstanceId::new();
    let b = InstanceId::new();

    for (id, seq) in [(a, 1), (b, 1), (a, 2)] {
        store
            .append_event(
                create_test_event(id, SequenceNumber::new(seq), "StepStarted"),
                AppendOptions::new(),
            )
            .await
            .unwrap();
    }

    let events: Vec<_> = store
        .stream_all_events()
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;
    let order: Vec<_> = events
        .iter()
        .map(|e| (e.instance_id, e.sequence.as_i64()))
        .collect();
    assert_eq!(order, [(a, 1), (b, 1), (a, 2)]);
}
