//! Participant operations: the remote calls a saga step makes.
//!
//! Operations are resolved to [`Operation`] trait objects when a definition
//! is registered, so the coordinator never dispatches on endpoint names at
//! runtime.

mod http;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use common::InstanceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Direction;

pub use http::HttpOperation;
pub use memory::InMemoryParticipant;

/// Payload sent to a participant for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantCall {
    pub instance_id: InstanceId,
    pub correlation_id: String,
    pub step_name: String,
    pub direction: Direction,
    pub attempt_number: u32,
    /// Stable across attempts of the same step and direction.
    pub idempotency_key: String,
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl ParticipantCall {
    /// Idempotency key shared by every attempt of one step in one direction.
    pub fn idempotency_key_for(
        instance_id: InstanceId,
        step_name: &str,
        direction: Direction,
    ) -> String {
        format!("{instance_id}:{step_name}:{direction}")
    }
}

/// A failed participant call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParticipantError {
    #[error("network error: {0}")]
    Network(String),

    #[error("call timed out: {0}")]
    Timeout(String),

    #[error("participant returned status {code}: {message}")]
    Status { code: u16, message: String },

    /// Explicit business rejection.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Whether a failed call is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Decides whether a participant error is retryable.
pub type ErrorClassifier = Arc<dyn Fn(&ParticipantError) -> ErrorClass + Send + Sync>;

/// Network errors, timeouts, 5xx, 408 and 429 are transient; every other
/// status and explicit rejections are permanent.
pub fn default_classifier() -> ErrorClassifier {
    Arc::new(classify)
}

fn classify(error: &ParticipantError) -> ErrorClass {
    match error {
        ParticipantError::Network(_) | ParticipantError::Timeout(_) => ErrorClass::Transient,
        ParticipantError::Status { code, .. } if *code >= 500 || *code == 408 || *code == 429 => {
            ErrorClass::Transient
        }
        ParticipantError::Status { .. } | ParticipantError::Rejected(_) => ErrorClass::Permanent,
    }
}

/// A forward or compensating operation of a saga step.
///
/// Implementations must be idempotent per `call.idempotency_key`: the
/// coordinator retries, and after a restart it may repeat a call whose
/// outcome was never recorded.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Performs the call. `Ok(Some(value))` is merged into the saga context.
    async fn invoke(
        &self,
        call: &ParticipantCall,
    ) -> Result<Option<serde_json::Value>, ParticipantError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ParticipantError {
        ParticipantError::Status {
            code,
            message: String::new(),
        }
    }

    #[test]
    fn test_default_classifier() {
        let classify = default_classifier();

        for transient in [
            ParticipantError::Network("reset".to_string()),
            ParticipantError::Timeout("no response within 1s".to_string()),
            status(500),
            status(503),
            status(408),
            status(429),
        ] {
            assert_eq!(classify(&transient), ErrorClass::Transient, "{transient}");
        }

        for permanent in [
            status(400),
            status(404),
            status(422),
            ParticipantError::Rejected("duplicate base".to_string()),
        ] {
            assert_eq!(classify(&permanent), ErrorClass::Permanent, "{permanent}");
        }
    }

    #[test]
    fn test_idempotency_key_is_per_step_and_direction() {
        let id = InstanceId::new();
        let forward = ParticipantCall::idempotency_key_for(id, "create_base", Direction::Forward);
        let undo = ParticipantCall::idempotency_key_for(id, "create_base", Direction::Compensate);
        assert_ne!(forward, undo);
        assert_eq!(
            forward,
            ParticipantCall::idempotency_key_for(id, "create_base", Direction::Forward)
        );
    }
}
