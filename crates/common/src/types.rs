use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for instance ids derived from submission idempotency keys.
const SUBMISSION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3f, 0x1c, 0x9a, 0x52, 0x7e, 0x04, 0x4b, 0x8d, 0xa1, 0x6e, 0x55, 0x20, 0xc7, 0x9b, 0x12, 0xd3,
]);

/// Unique identifier for a saga instance.
///
/// Every event, execution record and timeout entry is keyed by this id,
/// and it doubles as the partition key for single-writer execution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Creates a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a deterministic instance ID from a definition name and a
    /// caller-supplied idempotency key.
    ///
    /// Submitting twice with the same pair yields the same id, which lets the
    /// event store's optimistic concurrency check reject the duplicate.
    pub fn for_submission(definition: &str, idempotency_key: &str) -> Self {
        let name = format!("{definition}/{idempotency_key}");
        Self(Uuid::new_v5(&SUBMISSION_NAMESPACE, name.as_bytes()))
    }

    /// Creates an instance ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses an instance ID from its hyphenated string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for InstanceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<InstanceId> for Uuid {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}
