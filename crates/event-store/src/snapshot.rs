use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{InstanceId, SequenceNumber};

/// Materialized state of an instance as of a given sequence number.
///
/// Replay starts from the snapshot and applies only the events after
/// `sequence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The instance this snapshot belongs to.
    pub instance_id: InstanceId,

    /// Sequence number of the last event folded into `state`.
    pub sequence: SequenceNumber,

    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,

    /// The serialized instance state.
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        instance_id: InstanceId,
        sequence: SequenceNumber,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            instance_id,
            sequence,
            timestamp: Utc::now(),
            state: serde_json::to_value(state)?,
        })
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}
