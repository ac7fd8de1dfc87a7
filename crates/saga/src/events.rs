//! Saga ledger events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::StepExecutionRecord;

/// Every state transition of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The instance was created.
    SagaStarted(SagaStartedData),

    /// A forward step is about to be invoked. Written before the call.
    StepStarted(StepStartedData),

    /// A forward attempt failed; written before the retry decision is acted on.
    StepAttemptFailed(AttemptData),

    /// A forward step succeeded.
    StepCompleted(StepCompletedData),

    /// A forward step gave up, timed out, was aborted or has an unknown outcome.
    StepFailed(StepFailedData),

    /// An operator aborted the instance.
    AbortRequested(AbortRequestedData),

    /// The rollback plan was computed.
    CompensationStarted(CompensationStartedData),

    /// A compensation attempt failed.
    CompensationAttemptFailed(AttemptData),

    /// A step was compensated.
    CompensationStepCompleted(AttemptData),

    /// A compensation gave up after exhausting retries.
    CompensationStepFailed(CompensationStepFailedData),

    /// Every step completed (terminal).
    SagaCompleted(SagaFinishedData),

    /// The rollback completed (terminal).
    SagaCompensated(SagaFinishedData),

    /// The rollback could not be completed (terminal).
    SagaFailed(SagaFailedData),
}

impl SagaEvent {
    /// Returns the event type name stored alongside the payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::StepStarted(_) => "StepStarted",
            SagaEvent::StepAttemptFailed(_) => "StepAttemptFailed",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::AbortRequested(_) => "AbortRequested",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationAttemptFailed(_) => "CompensationAttemptFailed",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaCompensated(_) => "SagaCompensated",
            SagaEvent::SagaFailed(_) => "SagaFailed",
        }
    }

    /// Returns true for events that end an instance.
    pub fn is_terminal_type(event_type: &str) -> bool {
        matches!(event_type, "SagaCompleted" | "SagaCompensated" | "SagaFailed")
    }

    /// The attempt record carried by this event, if any.
    pub fn execution_record(&self) -> Option<&StepExecutionRecord> {
        match self {
            SagaEvent::StepAttemptFailed(data)
            | SagaEvent::CompensationAttemptFailed(data)
            | SagaEvent::CompensationStepCompleted(data) => Some(&data.record),
            SagaEvent::StepCompleted(data) => Some(&data.record),
            SagaEvent::StepFailed(data) => data.record.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub definition_name: String,
    pub step_count: usize,
    pub correlation_id: String,
    /// Caller identity, kept for audit.
    pub initiator: String,
    pub idempotency_key: Option<String>,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step_index: usize,
    pub step_name: String,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptData {
    pub record: StepExecutionRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub record: StepExecutionRecord,
    pub output: Option<serde_json::Value>,
}

/// Why a forward step stopped without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Permanent,
    RetriesExhausted,
    TimedOut,
    Aborted,
    /// Recovered after a restart with no recorded outcome.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub reason: FailureReason,
    pub error: String,
    /// Present when a call was in flight at the time of failure
    /// (timeout, abort, unknown outcome).
    pub record: Option<StepExecutionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortRequestedData {
    pub step_index: usize,
    pub reason: String,
    pub requested_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStartedData {
    pub failed_step: usize,
    /// Step indexes to compensate, in execution order.
    pub plan: Vec<usize>,
    /// Completed steps without a compensation.
    pub gaps: Vec<String>,
    /// Uncertain steps without a compensation.
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationStepFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFinishedData {
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub step_index: usize,
    pub step_name: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl SagaEvent {
    pub fn saga_completed() -> Self {
        SagaEvent::SagaCompleted(SagaFinishedData {
            finished_at: Utc::now(),
        })
    }

    pub fn saga_compensated() -> Self {
        SagaEvent::SagaCompensated(SagaFinishedData {
            finished_at: Utc::now(),
        })
    }

    pub fn saga_failed(step_index: usize, step_name: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            step_index,
            step_name: step_name.into(),
            error: error.into(),
            failed_at: Utc::now(),
        })
    }
}
