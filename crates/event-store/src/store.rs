use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{EventEnvelope, EventStoreError, InstanceId, Result, SequenceNumber, Snapshot};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Sequence number the instance's stream must currently end at.
    /// If None, no check is performed.
    pub expected_sequence: Option<SequenceNumber>,
}

impl AppendOptions {
    /// Creates options with no sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects the stream to currently end at `sequence`.
    pub fn expect_sequence(sequence: SequenceNumber) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Expects the instance to have no events yet.
    pub fn expect_new() -> Self {
        Self::expect_sequence(SequenceNumber::initial())
    }
}

/// A stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Append-only storage for saga instance events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events for one instance atomically.
    ///
    /// With `options.expected_sequence` set, the write is rejected with
    /// `ConcurrencyConflict` unless the stream currently ends there.
    /// Returns the sequence number of the last appended event.
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceNumber>;

    /// Returns all events of an instance in sequence order.
    async fn load_events(&self, instance_id: InstanceId) -> Result<Vec<EventEnvelope>>;

    /// Returns the events of an instance starting at `from` (inclusive).
    async fn load_events_from(
        &self,
        instance_id: InstanceId,
        from: SequenceNumber,
    ) -> Result<Vec<EventEnvelope>>;

    /// Returns the sequence number of the instance's last event, if any.
    async fn last_sequence(&self, instance_id: InstanceId) -> Result<Option<SequenceNumber>>;

    /// Streams every stored event in insertion order.
    async fn stream_all_events(&self) -> Result<EventStream>;

    /// Stores a snapshot, replacing any previous one for the instance.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Returns the latest snapshot of an instance.
    async fn get_snapshot(&self, instance_id: InstanceId) -> Result<Option<Snapshot>>;
}

/// Convenience methods available on every event store.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event.
    async fn append_event(
        &self,
        event: EventEnvelope,
        options: AppendOptions,
    ) -> Result<SequenceNumber> {
        self.append(vec![event], options).await
    }

    /// Returns true if the instance has at least one event.
    async fn instance_exists(&self, instance_id: InstanceId) -> Result<bool> {
        Ok(self.last_sequence(instance_id).await?.is_some())
    }

    /// Loads the latest snapshot (if any) and the events recorded after it.
    async fn load_stream(
        &self,
        instance_id: InstanceId,
    ) -> Result<(Option<Snapshot>, Vec<EventEnvelope>)> {
        if let Some(snapshot) = self.get_snapshot(instance_id).await? {
            let events = self
                .load_events_from(instance_id, snapshot.sequence.next())
                .await?;
            Ok((Some(snapshot), events))
        } else {
            let events = self.load_events(instance_id).await?;
            Ok((None, events))
        }
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Checks that a batch targets one instance and is numbered contiguously.
pub(crate) fn validate_batch(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty batch".to_string(),
        ));
    };

    let mut expected = first.sequence;
    for event in events.iter().skip(1) {
        if event.instance_id != first.instance_id {
            return Err(EventStoreError::InvalidAppend(
                "all events in a batch must belong to the same instance".to_string(),
            ));
        }
        expected = expected.next();
        if event.sequence != expected {
            return Err(EventStoreError::InvalidAppend(format!(
                "sequence numbers must be contiguous: expected {expected}, got {}",
                event.sequence
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(instance_id: InstanceId, sequence: i64) -> EventEnvelope {
        EventEnvelope::builder()
            .instance_id(instance_id)
            .sequence(SequenceNumber::new(sequence))
            .event_type("StepStarted")
            .payload_raw(serde_json::json!({}))
            .build()
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(
            validate_batch(&[]),
            Err(EventStoreError::InvalidAppend(_))
        ));
    }

    #[test]
    fn gaps_in_sequence_are_rejected() {
        let id = InstanceId::new();
        let result = validate_batch(&[event(id, 1), event(id, 3)]);
        assert!(matches!(result, Err(EventStoreError::InvalidAppend(_))));
    }

    #[test]
    fn mixed_instances_are_rejected() {
        let result = validate_batch(&[event(InstanceId::new(), 1), event(InstanceId::new(), 2)]);
        assert!(matches!(result, Err(EventStoreError::InvalidAppend(_))));
    }

    #[test]
    fn contiguous_batch_is_accepted() {
        let id = InstanceId::new();
        assert!(validate_batch(&[event(id, 4), event(id, 5), event(id, 6)]).is_ok());
    }
}
