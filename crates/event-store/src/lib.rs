//! Append-only event ledger for saga instances.
//!
//! Every state transition of a saga instance is stored as an
//! [`EventEnvelope`] with a strictly increasing per-instance
//! [`SequenceNumber`]. Replaying an instance's events in order rebuilds its
//! state; [`Snapshot`]s bound the replay cost of long-running instances.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod snapshot;
pub mod store;

pub use common::InstanceId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, SequenceNumber};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use snapshot::Snapshot;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream};
