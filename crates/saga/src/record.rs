//! Step execution records and timeout entries.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::InstanceId;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// Whether an operation moves the saga forward or undoes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Compensate,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forward" => Ok(Direction::Forward),
            "compensate" => Ok(Direction::Compensate),
            other => Err(SagaError::Repository(format!("unknown direction '{other}'"))),
        }
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    /// No answer arrived in time, from the participant call or the step
    /// deadline. The call may have applied.
    TimedOut,
    /// An operator aborted the instance while the call was in flight.
    Aborted,
    /// The call was sent but no response was recorded before a restart.
    Unknown,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::TimedOut => "timed_out",
            AttemptStatus::Aborted => "aborted",
            AttemptStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "timed_out" => Ok(AttemptStatus::TimedOut),
            "aborted" => Ok(AttemptStatus::Aborted),
            "unknown" => Ok(AttemptStatus::Unknown),
            other => Err(SagaError::Repository(format!(
                "unknown attempt status '{other}'"
            ))),
        }
    }
}

/// One attempted call of a step's forward or compensating operation.
///
/// A new record is written per attempt; records are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub instance_id: InstanceId,
    pub step_index: usize,
    pub step_name: String,
    pub direction: Direction,
    /// 1-based attempt number within this direction.
    pub attempt: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl StepExecutionRecord {
    pub fn is_forward_success(&self) -> bool {
        self.direction == Direction::Forward && self.status == AttemptStatus::Succeeded
    }

    pub fn is_compensation_success(&self) -> bool {
        self.direction == Direction::Compensate && self.status == AttemptStatus::Succeeded
    }

    /// The call was sent and its effect on the participant is not known.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self.status,
            AttemptStatus::TimedOut | AttemptStatus::Aborted | AttemptStatus::Unknown
        )
    }
}

/// Deadline of an in-flight step.
///
/// Exists exactly while the step is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutEntry {
    pub instance_id: InstanceId,
    pub step_index: usize,
    pub deadline: DateTime<Utc>,
}
