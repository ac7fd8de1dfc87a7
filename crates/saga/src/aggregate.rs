//! Event-sourced saga instance.

use chrono::{DateTime, Utc};
use common::InstanceId;
use event_store::{EventEnvelope, SequenceNumber, Snapshot};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::events::{FailureReason, SagaEvent};
use crate::record::{Direction, StepExecutionRecord};
use crate::state::SagaStatus;

/// A forward step whose call has started and not yet finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InFlightStep {
    pub step_index: usize,
    pub step_name: String,
    pub deadline: DateTime<Utc>,
}

/// The forward step that sent the instance into compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_index: usize,
    pub step_name: String,
    pub reason: FailureReason,
    pub error: String,
    /// A call was in flight when the step failed.
    pub interrupted_mid_call: bool,
}

/// A step and the error that left it unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub step_index: usize,
    pub step_name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationProgress {
    pub failed_step: usize,
    pub plan: Vec<usize>,
    /// Number of plan entries compensated so far.
    pub completed: usize,
    pub gaps: Vec<String>,
    pub unresolved: Vec<String>,
    pub failure: Option<StepError>,
}

/// What the driver of an instance has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Execute(usize),
    /// A call was in flight when the previous driver stopped.
    ResolveUnknown(usize),
    PlanCompensation,
    Compensate(usize),
    Complete,
    FinishCompensated,
    FinishFailed,
    Done,
}

/// State of one saga execution, rebuilt by replaying its events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    id: Option<InstanceId>,
    sequence: SequenceNumber,
    definition_name: String,
    step_count: usize,
    correlation_id: String,
    initiator: String,
    status: SagaStatus,
    current_step: usize,
    in_flight: Option<InFlightStep>,
    context: serde_json::Map<String, serde_json::Value>,
    records: Vec<StepExecutionRecord>,
    failure: Option<StepFailure>,
    compensation: Option<CompensationProgress>,
    terminal_error: Option<StepError>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    /// Rebuilds an instance from an optional snapshot and the events after it.
    pub fn replay(snapshot: Option<Snapshot>, events: &[EventEnvelope]) -> Result<Self> {
        let mut instance = match snapshot {
            Some(snapshot) => snapshot.into_state::<SagaInstance>()?,
            None => SagaInstance::default(),
        };
        for envelope in events {
            instance.apply_envelope(envelope)?;
        }
        Ok(instance)
    }

    /// Applies a stored event. Envelopes at or below the current sequence
    /// number were already applied and are skipped.
    pub fn apply_envelope(&mut self, envelope: &EventEnvelope) -> Result<()> {
        if envelope.sequence <= self.sequence {
            return Ok(());
        }
        let event: SagaEvent = serde_json::from_value(envelope.payload.clone())?;
        if self.id.is_none() {
            self.id = Some(envelope.instance_id);
        }
        self.apply(&event)?;
        self.sequence = envelope.sequence;
        self.updated_at = Some(envelope.timestamp);
        Ok(())
    }

    fn require(&self, expected: SagaStatus) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(SagaError::InvalidState {
                expected: expected.to_string(),
                actual: self.status,
            })
        }
    }

    fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidState {
                expected: format!("a status that may move to {next}"),
                actual: self.status,
            });
        }
        self.status = next;
        Ok(())
    }

    fn apply(&mut self, event: &SagaEvent) -> Result<()> {
        match event {
            SagaEvent::SagaStarted(data) => {
                self.transition(SagaStatus::Running)?;
                self.definition_name = data.definition_name.clone();
                self.step_count = data.step_count;
                self.correlation_id = data.correlation_id.clone();
                self.initiator = data.initiator.clone();
                self.context = data.context.clone();
                self.created_at = Some(data.started_at);
            }
            SagaEvent::StepStarted(data) => {
                self.require(SagaStatus::Running)?;
                self.current_step = data.step_index;
                self.in_flight = Some(InFlightStep {
                    step_index: data.step_index,
                    step_name: data.step_name.clone(),
                    deadline: data.deadline,
                });
            }
            SagaEvent::StepAttemptFailed(data) => {
                self.require(SagaStatus::Running)?;
                self.records.push(data.record.clone());
            }
            SagaEvent::StepCompleted(data) => {
                self.require(SagaStatus::Running)?;
                self.records.push(data.record.clone());
                self.merge_output(&data.record.step_name, data.output.as_ref());
                self.in_flight = None;
                self.current_step = data.record.step_index + 1;
                if self.current_step >= self.step_count {
                    self.transition(SagaStatus::Completing)?;
                }
            }
            SagaEvent::StepFailed(data) => {
                self.require(SagaStatus::Running)?;
                if let Some(record) = &data.record {
                    self.records.push(record.clone());
                }
                self.in_flight = None;
                self.failure = Some(StepFailure {
                    step_index: data.step_index,
                    step_name: data.step_name.clone(),
                    reason: data.reason,
                    error: data.error.clone(),
                    interrupted_mid_call: data.record.is_some(),
                });
            }
            SagaEvent::AbortRequested(_) => {
                self.require(SagaStatus::Running)?;
            }
            SagaEvent::CompensationStarted(data) => {
                self.transition(SagaStatus::Compensating)?;
                self.compensation = Some(CompensationProgress {
                    failed_step: data.failed_step,
                    plan: data.plan.clone(),
                    completed: 0,
                    gaps: data.gaps.clone(),
                    unresolved: data.unresolved.clone(),
                    failure: None,
                });
            }
            SagaEvent::CompensationAttemptFailed(data) => {
                self.require(SagaStatus::Compensating)?;
                self.records.push(data.record.clone());
            }
            SagaEvent::CompensationStepCompleted(data) => {
                self.transition(SagaStatus::Compensating)?;
                self.records.push(data.record.clone());
                if let Some(progress) = self.compensation.as_mut() {
                    progress.completed += 1;
                }
            }
            SagaEvent::CompensationStepFailed(data) => {
                self.require(SagaStatus::Compensating)?;
                if let Some(progress) = self.compensation.as_mut() {
                    progress.failure = Some(StepError {
                        step_index: data.step_index,
                        step_name: data.step_name.clone(),
                        error: data.error.clone(),
                    });
                }
            }
            SagaEvent::SagaCompleted(_) => {
                self.transition(SagaStatus::Completed)?;
            }
            SagaEvent::SagaCompensated(_) => {
                self.transition(SagaStatus::Compensated)?;
            }
            SagaEvent::SagaFailed(data) => {
                self.transition(SagaStatus::Failed)?;
                self.terminal_error = Some(StepError {
                    step_index: data.step_index,
                    step_name: data.step_name.clone(),
                    error: data.error.clone(),
                });
            }
        }
        Ok(())
    }

    /// Object outputs are merged key by key; any other output is stored
    /// under the step name.
    fn merge_output(&mut self, step_name: &str, output: Option<&serde_json::Value>) {
        match output {
            Some(serde_json::Value::Object(map)) => {
                for (key, value) in map {
                    self.context.insert(key.clone(), value.clone());
                }
            }
            Some(value) => {
                self.context.insert(step_name.to_string(), value.clone());
            }
            None => {}
        }
    }

    /// Derives the next driver action from the current state.
    pub fn next_action(&self) -> NextAction {
        match self.status {
            SagaStatus::Running => {
                if let Some(in_flight) = &self.in_flight {
                    NextAction::ResolveUnknown(in_flight.step_index)
                } else if self.failure.is_some() {
                    NextAction::PlanCompensation
                } else {
                    NextAction::Execute(self.current_step)
                }
            }
            SagaStatus::Completing => NextAction::Complete,
            SagaStatus::Compensating => match &self.compensation {
                Some(progress) if progress.failure.is_some() => NextAction::FinishFailed,
                Some(progress) if progress.completed < progress.plan.len() => {
                    NextAction::Compensate(progress.plan[progress.completed])
                }
                Some(progress) if !progress.unresolved.is_empty() => NextAction::FinishFailed,
                _ => NextAction::FinishCompensated,
            },
            SagaStatus::Initializing
            | SagaStatus::Completed
            | SagaStatus::Compensated
            | SagaStatus::Failed => NextAction::Done,
        }
    }
}

// Query methods
impl SagaInstance {
    pub fn id(&self) -> Option<InstanceId> {
        self.id
    }

    /// Sequence number of the last applied event.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn definition_name(&self) -> &str {
        &self.definition_name
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn in_flight(&self) -> Option<&InFlightStep> {
        self.in_flight.as_ref()
    }

    /// Accumulated step outputs.
    pub fn context(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.context
    }

    /// Every attempt record in the order it was written.
    pub fn records(&self) -> &[StepExecutionRecord] {
        &self.records
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        self.failure.as_ref()
    }

    pub fn compensation(&self) -> Option<&CompensationProgress> {
        self.compensation.as_ref()
    }

    /// For `Failed` instances, the step and error that could not be undone.
    pub fn terminal_error(&self) -> Option<&StepError> {
        self.terminal_error.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Number of forward attempts recorded for a step.
    pub fn forward_attempts(&self, step_index: usize) -> u32 {
        self.records
            .iter()
            .filter(|r| r.step_index == step_index && r.direction == Direction::Forward)
            .count() as u32
    }
}
