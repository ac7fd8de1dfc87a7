//! Saga error types.

use common::InstanceId;
use event_store::{EventStoreError, SequenceNumber};
use thiserror::Error;

use crate::participants::{ErrorClass, ParticipantError};
use crate::state::SagaStatus;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A step kept failing with retryable errors until its retries ran out.
    #[error("Step '{step}' failed after exhausting retries: {message}")]
    TransientStep { step: String, message: String },

    /// A step failed with a non-retryable error.
    #[error("Step '{step}' failed permanently: {message}")]
    PermanentStep { step: String, message: String },

    /// A step did not finish before its deadline.
    #[error("Step '{step}' timed out")]
    Timeout { step: String },

    /// A compensating operation failed after exhausting retries.
    #[error("Compensation for step '{step}' failed: {message}")]
    CompensationFailed { step: String, message: String },

    /// The event store could not durably record a transition.
    #[error("Persistence error: {0}")]
    Persistence(EventStoreError),

    /// A second writer advanced the instance's event stream.
    #[error(
        "Concurrency violation on instance {instance_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyViolation {
        instance_id: InstanceId,
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// A saga definition failed validation.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// No definition is registered under this name.
    #[error("Unknown saga definition: {0}")]
    UnknownDefinition(String),

    /// Instance is in an invalid status for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState { expected: String, actual: SagaStatus },

    /// No instance with this id exists.
    #[error("Saga instance not found: {0}")]
    NotFound(InstanceId),

    /// The instance has no live driver to deliver a signal to.
    #[error("Saga instance {0} is not running")]
    NotRunning(InstanceId),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The saga repository failed.
    #[error("Repository error: {0}")]
    Repository(String),
}

impl SagaError {
    /// Builds the step-level error for a forward step that gave up.
    pub fn step_failure(step: &str, error: &ParticipantError, class: ErrorClass) -> Self {
        match class {
            ErrorClass::Transient => SagaError::TransientStep {
                step: step.to_string(),
                message: error.to_string(),
            },
            ErrorClass::Permanent => SagaError::PermanentStep {
                step: step.to_string(),
                message: error.to_string(),
            },
        }
    }
}

impl From<EventStoreError> for SagaError {
    fn from(error: EventStoreError) -> Self {
        match error {
            EventStoreError::ConcurrencyConflict {
                instance_id,
                expected,
                actual,
            } => SagaError::ConcurrencyViolation {
                instance_id,
                expected,
                actual,
            },
            other => SagaError::Persistence(other),
        }
    }
}

impl From<sqlx::Error> for SagaError {
    fn from(error: sqlx::Error) -> Self {
        SagaError::Repository(error.to_string())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_concurrency_violation() {
        let id = InstanceId::new();
        let err: SagaError = EventStoreError::ConcurrencyConflict {
            instance_id: id,
            expected: SequenceNumber::new(3),
            actual: SequenceNumber::new(4),
        }
        .into();
        assert!(matches!(
            err,
            SagaError::ConcurrencyViolation { instance_id, .. } if instance_id == id
        ));
    }

    #[test]
    fn test_other_store_errors_map_to_persistence() {
        let err: SagaError = EventStoreError::Unavailable("down".to_string()).into();
        assert!(matches!(err, SagaError::Persistence(_)));
    }

    #[test]
    fn test_step_failure_follows_error_class() {
        let error = ParticipantError::Status {
            code: 503,
            message: "busy".to_string(),
        };
        assert!(matches!(
            SagaError::step_failure("sync", &error, ErrorClass::Transient),
            SagaError::TransientStep { .. }
        ));
        assert!(matches!(
            SagaError::step_failure("sync", &error, ErrorClass::Permanent),
            SagaError::PermanentStep { .. }
        ));
    }
}
