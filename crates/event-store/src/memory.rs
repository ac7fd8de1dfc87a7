use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, EventStoreError, InstanceId, Result, SequenceNumber, Snapshot,
    store::{AppendOptions, EventStore, EventStream, validate_batch},
};

#[derive(Default)]
struct Ledger {
    /// Every event in insertion order.
    log: Vec<EventEnvelope>,
    /// Positions in `log` per instance, ascending by sequence.
    streams: HashMap<InstanceId, Vec<usize>>,
}

impl Ledger {
    fn last_sequence(&self, instance_id: InstanceId) -> SequenceNumber {
        self.streams
            .get(&instance_id)
            .and_then(|positions| positions.last())
            .map(|&pos| self.log[pos].sequence)
            .unwrap_or_default()
    }

    fn stream(&self, instance_id: InstanceId, from: SequenceNumber) -> Vec<EventEnvelope> {
        self.streams
            .get(&instance_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&pos| &self.log[pos])
                    .filter(|e| e.sequence >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory event store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    ledger: Arc<RwLock<Ledger>>,
    snapshots: Arc<RwLock<HashMap<InstanceId, Snapshot>>>,
    fail_appends: Arc<AtomicBool>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent append fail with `Unavailable`.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.ledger.read().await.log.len()
    }

    /// Returns the number of stored snapshots.
    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceNumber> {
        validate_batch(&events)?;

        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(EventStoreError::Unavailable(
                "appends disabled".to_string(),
            ));
        }

        let instance_id = events[0].instance_id;
        let first_new = events[0].sequence;

        let mut ledger = self.ledger.write().await;
        let current = ledger.last_sequence(instance_id);

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(EventStoreError::ConcurrencyConflict {
                instance_id,
                expected,
                actual: current,
            });
        }

        // Unique (instance_id, sequence) constraint
        if first_new != current.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                instance_id,
                expected: options.expected_sequence.unwrap_or(current),
                actual: current,
            });
        }

        let last = events
            .last()
            .map(|e| e.sequence)
            .unwrap_or(SequenceNumber::initial());
        for event in events {
            let pos = ledger.log.len();
            ledger.log.push(event);
            ledger.streams.entry(instance_id).or_default().push(pos);
        }

        Ok(last)
    }

    async fn load_events(&self, instance_id: InstanceId) -> Result<Vec<EventEnvelope>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.stream(instance_id, SequenceNumber::initial()))
    }

    async fn load_events_from(
        &self,
        instance_id: InstanceId,
        from: SequenceNumber,
    ) -> Result<Vec<EventEnvelope>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.stream(instance_id, from))
    }

    async fn last_sequence(&self, instance_id: InstanceId) -> Result<Option<SequenceNumber>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .streams
            .contains_key(&instance_id)
            .then(|| ledger.last_sequence(instance_id)))
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let events = self.ledger.read().await.log.clone();
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.instance_id, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, instance_id: InstanceId) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&instance_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStoreExt;

    fn event(instance_id: InstanceId, sequence: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .instance_id(instance_id)
            .sequence(SequenceNumber::new(sequence))
            .event_type(event_type)
            .payload_raw(serde_json::json!({"test": true}))
            .build()
    }

    #[tokio::test]
    async fn append_and_replay_in_order() {
        let store = InMemoryEventStore::new();
        let id = InstanceId::new();

        let last = store
            .append(
                vec![
                    event(id, 1, "SagaStarted"),
                    event(id, 2, "StepStarted"),
                    event(id, 3, "StepCompleted"),
                ],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
        assert_eq!(last, SequenceNumber::new(3));

        let events = store.load_events(id).await.unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["SagaStarted", "StepStarted", "StepCompleted"]);
    }

    #[tokio::test]
    async fn stale_expected_sequence_is_a_conflict() {
        let store = InMemoryEventStore::new();
        let id = InstanceId::new();
        store
            .append_event(event(id, 1, "SagaStarted"), AppendOptions::expect_new())
            .await
            .unwrap();

        let result = store
            .append_event(event(id, 2, "StepStarted"), AppendOptions::expect_new())
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { expected, actual, .. })
                if expected == SequenceNumber::initial() && actual == SequenceNumber::first()
        ));
    }

    #[tokio::test]
    async fn duplicate_sequence_without_expectation_is_a_conflict() {
        let store = InMemoryEventStore::new();
        let id = InstanceId::new();
        store
            .append_event(event(id, 1, "SagaStarted"), AppendOptions::new())
            .await
            .unwrap();

        let result = store
            .append_event(event(id, 1, "SagaStarted"), AppendOptions::new())
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn streams_are_isolated_per_instance() {
        let store = InMemoryEventStore::new();
        let a = InstanceId::new();
        let b = InstanceId::new();

        store
            .append_event(event(a, 1, "SagaStarted"), AppendOptions::expect_new())
            .await
            .unwrap();
        store
            .append_event(event(b, 1, "SagaStarted"), AppendOptions::expect_new())
            .await
            .unwrap();
        store
            .append_event(
                event(a, 2, "StepStarted"),
                AppendOptions::expect_sequence(SequenceNumber::first()),
            )
            .await
            .unwrap();

        assert_eq!(store.load_events(a).await.unwrap().len(), 2);
        assert_eq!(store.load_events(b).await.unwrap().len(), 1);
        assert_eq!(
            store.last_sequence(a).await.unwrap(),
            Some(SequenceNumber::new(2))
        );
        assert_eq!(store.last_sequence(InstanceId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_appends_write_nothing() {
        let store = InMemoryEventStore::new();
        store.set_fail_appends(true);
        let id = InstanceId::new();

        let result = store
            .append_event(event(id, 1, "SagaStarted"), AppendOptions::expect_new())
            .await;
        assert!(matches!(result, Err(EventStoreError::Unavailable(_))));
        assert!(!store.instance_exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn load_stream_resumes_after_snapshot() {
        let store = InMemoryEventStore::new();
        let id = InstanceId::new();
        let events = (1..=5).map(|s| event(id, s, "StepStarted")).collect();
        store.append(events, AppendOptions::expect_new()).await.unwrap();

        let snapshot =
            Snapshot::from_state(id, SequenceNumber::new(3), &serde_json::json!({"n": 3}))
                .unwrap();
        store.save_snapshot(snapshot).await.unwrap();

        let (snapshot, tail) = store.load_stream(id).await.unwrap();
        assert_eq!(snapshot.unwrap().sequence, SequenceNumber::new(3));
        let sequences: Vec<_> = tail.iter().map(|e| e.sequence.as_i64()).collect();
        assert_eq!(sequences, [4, 5]);
    }

    #[tokio::test]
    async fn stream_all_preserves_insertion_order() {
        use futures_util::StreamExt;

        let store = InMemoryEventStore::new();
        let a = InstanceId::new();
        let b = InstanceId::new();
        store
            .append_event(event(b, 1, "SagaStarted"), AppendOptions::new())
            .await
            .unwrap();
        store
            .append_event(event(a, 1, "SagaStarted"), AppendOptions::new())
            .await
            .unwrap();

        let events: Vec<_> = store.stream_all_events().await.unwrap().collect().await;
        let ids: Vec<_> = events.into_iter().map(|e| e.unwrap().instance_id).collect();
        assert_eq!(ids, [b, a]);
    }
}
