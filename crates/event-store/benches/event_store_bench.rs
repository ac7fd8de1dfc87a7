use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreExt, InMemoryEventStore, InstanceId,
    SequenceNumber, Snapshot,
};

fn make_event(instance_id: InstanceId, sequence: i64) -> EventEnvelope {
    EventEnvelope::builder()
        .instance_id(instance_id)
        .sequence(SequenceNumber::new(sequence))
        .event_type("StepCompleted")
        .payload_raw(serde_json::json!({
            "type": "StepCompleted",
            "data": {
                "step_index": sequence,
                "output": {"record_id": format!("rec-{sequence}")}
            }
        }))
        .build()
}

fn populated_store(rt: &tokio::runtime::Runtime, instances: usize, per_instance: i64) -> (InMemoryEventStore, InstanceId) {
    let store = InMemoryEventStore::new();
    let mut last = InstanceId::new();
    rt.block_on(async {
        for _ in 0..instances {
            last = InstanceId::new();
            let events = (1..=per_instance).map(|s| make_event(last, s)).collect();
            store.append(events, AppendOptions::new()).await.unwrap();
        }
    });
    (store, last)
}

/// Write-ahead pattern of a driver: one append per transition, each
/// guarded by the expected sequence.
fn bench_sequential_appends(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/sequential_appends_20", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let id = InstanceId::new();
                let mut current = SequenceNumber::initial();
                for s in 1..=20 {
                    current = store
                        .append_event(make_event(id, s), AppendOptions::expect_sequence(current))
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_replay(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("event_store/replay");

    for size in [10_i64, 100, 1000] {
        let (store, id) = populated_store(&rt, 1, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    store.load_events(id).await.unwrap();
                });
            });
        });
    }

    group.finish();
}

fn bench_load_stream_with_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, id) = populated_store(&rt, 1, 1000);
    rt.block_on(async {
        let snapshot =
            Snapshot::from_state(id, SequenceNumber::new(950), &serde_json::json!({"step": 950}))
                .unwrap();
        store.save_snapshot(snapshot).await.unwrap();
    });

    c.bench_function("event_store/load_stream_snapshot_950_of_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.load_stream(id).await.unwrap();
            });
        });
    });
}

fn bench_recovery_scan(c: &mut Criterion) {
    use futures_util::StreamExt;

    let rt = tokio::runtime::Runtime::new().unwrap();
    let (store, _) = populated_store(&rt, 10, 100);

    c.bench_function("event_store/stream_1000_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut stream = store.stream_all_events().await.unwrap();
                let mut count = 0;
                while let Some(result) = stream.next().await {
                    result.unwrap();
                    count += 1;
                }
                assert_eq!(count, 1000);
            });
        });
    });
}

criterion_group!(
    benches,
    bench_sequential_appends,
    bench_replay,
    bench_load_stream_with_snapshot,
    bench_recovery_scan,
);
criterion_main!(benches);
