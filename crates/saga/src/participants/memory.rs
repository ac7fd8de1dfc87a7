//! In-process participant for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::{Operation, ParticipantCall, ParticipantError};
use crate::record::Direction;

#[derive(Debug, Default)]
struct InMemoryParticipantState {
    /// Resources currently applied, keyed by "instance/step".
    applied: HashMap<String, String>,
    next_id: u32,
    forward_calls: u32,
    compensation_calls: u32,
    /// Keys whose resource was actually removed by a compensation.
    undone: Vec<String>,
    fail_permanently: bool,
    transient_failures: u32,
    hang: bool,
    apply_then_hang: bool,
    compensation_failures: u32,
}

enum Action {
    Reply(Result<Option<serde_json::Value>, ParticipantError>),
    Hang,
}

/// A participant holding an idempotent in-memory resource ledger.
///
/// Serves both directions: a forward call creates one resource per
/// instance and step (repeating the call returns the same resource), a
/// compensating call removes it and succeeds even if there is nothing to
/// undo. Failure behaviour is scripted with the `set_*` methods.
#[derive(Debug, Clone)]
pub struct InMemoryParticipant {
    name: String,
    state: Arc<RwLock<InMemoryParticipantState>>,
}

impl InMemoryParticipant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
        }
    }

    /// Returns this participant as a shareable operation.
    pub fn operation(&self) -> Arc<dyn Operation> {
        Arc::new(self.clone())
    }

    /// Rejects every forward call with a 422.
    pub fn set_fail_permanently(&self, fail: bool) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).fail_permanently = fail;
    }

    /// Answers the next `count` forward calls with a 503.
    pub fn set_transient_failures(&self, count: u32) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).transient_failures = count;
    }

    /// Never answers forward calls.
    pub fn set_hang(&self, hang: bool) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).hang = hang;
    }

    /// Applies the resource on a forward call but never answers.
    pub fn set_apply_then_hang(&self, hang: bool) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).apply_then_hang = hang;
    }

    /// Answers the next `count` compensating calls with a 503.
    pub fn set_compensation_failures(&self, count: u32) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).compensation_failures = count;
    }

    /// Number of resources currently applied.
    pub fn applied_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).applied.len()
    }

    pub fn forward_calls(&self) -> u32 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).forward_calls
    }

    pub fn compensation_calls(&self) -> u32 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).compensation_calls
    }

    /// Keys of resources removed by compensations, in removal order.
    pub fn undone(&self) -> Vec<String> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).undone.clone()
    }

    fn resource_key(call: &ParticipantCall) -> String {
        format!("{}/{}", call.instance_id, call.step_name)
    }

    fn forward(&self, call: &ParticipantCall) -> Action {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.forward_calls += 1;

        if state.hang {
            return Action::Hang;
        }
        if state.fail_permanently {
            return Action::Reply(Err(ParticipantError::Status {
                code: 422,
                message: format!("{} rejected the request", self.name),
            }));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Action::Reply(Err(ParticipantError::Status {
                code: 503,
                message: format!("{} unavailable", self.name),
            }));
        }

        let key = Self::resource_key(call);
        let resource_id = match state.applied.get(&key) {
            Some(existing) => existing.clone(),
            None => {
                state.next_id += 1;
                let id = format!("{}-{:04}", self.name, state.next_id);
                state.applied.insert(key, id.clone());
                id
            }
        };

        if state.apply_then_hang {
            return Action::Hang;
        }
        let mut output = serde_json::Map::new();
        output.insert(self.name.clone(), resource_id.into());
        Action::Reply(Ok(Some(output.into())))
    }

    fn compensate(&self, call: &ParticipantCall) -> Action {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.compensation_calls += 1;

        if state.compensation_failures > 0 {
            state.compensation_failures -= 1;
            return Action::Reply(Err(ParticipantError::Status {
                code: 503,
                message: format!("{} could not undo", self.name),
            }));
        }

        let key = Self::resource_key(call);
        if state.applied.remove(&key).is_some() {
            state.undone.push(key);
        }
        Action::Reply(Ok(None))
    }
}

#[async_trait]
impl Operation for InMemoryParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        call: &ParticipantCall,
    ) -> Result<Option<serde_json::Value>, ParticipantError> {
        let action = match call.direction {
            Direction::Forward => self.forward(call),
            Direction::Compensate => self.compensate(call),
        };

        match action {
            Action::Reply(result) => result,
            Action::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::InstanceId;
    use serde_json::json;

    fn call(instance_id: InstanceId, direction: Direction) -> ParticipantCall {
        ParticipantCall {
            instance_id,
            correlation_id: "corr".to_string(),
            step_name: "create_base".to_string(),
            direction,
            attempt_number: 1,
            idempotency_key: ParticipantCall::idempotency_key_for(
                instance_id,
                "create_base",
                direction,
            ),
            context: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_forward_is_idempotent() {
        let participant = InMemoryParticipant::new("base");
        let id = InstanceId::new();

        let first = participant.invoke(&call(id, Direction::Forward)).await.unwrap();
        let second = participant.invoke(&call(id, Direction::Forward)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, Some(json!({"base": "base-0001"})));
        assert_eq!(participant.applied_count(), 1);
        assert_eq!(participant.forward_calls(), 2);
    }

    #[tokio::test]
    async fn test_compensation_tolerates_nothing_to_undo() {
        let participant = InMemoryParticipant::new("base");
        let id = InstanceId::new();

        participant.invoke(&call(id, Direction::Forward)).await.unwrap();
        participant.invoke(&call(id, Direction::Compensate)).await.unwrap();
        participant.invoke(&call(id, Direction::Compensate)).await.unwrap();

        assert_eq!(participant.applied_count(), 0);
        assert_eq!(participant.undone(), [format!("{id}/create_base")]);
        assert_eq!(participant.compensation_calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let participant = InMemoryParticipant::new("sync");
        participant.set_transient_failures(2);
        let id = InstanceId::new();

        for _ in 0..2 {
            let err = participant
                .invoke(&call(id, Direction::Forward))
                .await
                .unwrap_err();
            assert!(matches!(err, ParticipantError::Status { code: 503, .. }));
        }
        assert!(participant.invoke(&call(id, Direction::Forward)).await.is_ok());
    }

    #[tokio::test]
    async fn test_permanent_failure_applies_nothing() {
        let participant = InMemoryParticipant::new("sync");
        participant.set_fail_permanently(true);

        let err = participant
            .invoke(&call(InstanceId::new(), Direction::Forward))
            .await
            .unwrap_err();
        assert!(matches!(err, ParticipantError::Status { code: 422, .. }));
        assert_eq!(participant.applied_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_then_hang_leaves_resource_behind() {
        let participant = InMemoryParticipant::new("base");
        participant.set_apply_then_hang(true);

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            participant.invoke(&call(InstanceId::new(), Direction::Forward)),
        )
        .await;

        assert!(pending.is_err());
        assert_eq!(participant.applied_count(), 1);
    }

    #[test]
    fn test_poisoned_state_stays_usable() {
        let participant = InMemoryParticipant::new("base");
        let state = Arc::clone(&participant.state);
        let _ = std::thread::spawn(move || {
            let _guard = state.write().unwrap();
            panic!("poison the ledger");
        })
        .join();

        participant.set_transient_failures(1);
        assert_eq!(participant.applied_count(), 0);
        assert_eq!(participant.forward_calls(), 0);
    }
}
