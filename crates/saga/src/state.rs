//! Saga instance status machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// The status of a saga instance in its lifecycle.
///
/// State transitions:
/// ```text
/// Initializing ──► Running ──┬──► Completing ──► Completed
///                            └──► Compensating ──┬──► Compensated
///                                                └──► Failed
/// ```
///
/// `Running` advances step by step; `Compensating` counts down through the
/// compensation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Submitted, "started" event not yet persisted.
    #[default]
    Initializing,

    /// Forward steps are being executed.
    Running,

    /// Every forward step succeeded; the final event is being written.
    Completing,

    /// A step failed and compensating operations are in progress.
    Compensating,

    /// All steps completed successfully (terminal).
    Completed,

    /// Every required compensation succeeded (terminal).
    Compensated,

    /// A compensation could not be completed; needs an operator (terminal).
    Failed,
}

impl SagaStatus {
    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns true if moving from `self` to `next` follows the state graph.
    ///
    /// `Running` and `Compensating` may transition to themselves (next step,
    /// next compensation).
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;

        matches!(
            (self, next),
            (Initializing, Running)
                | (Running, Running)
                | (Running, Completing)
                | (Running, Compensating)
                | (Completing, Completed)
                | (Compensating, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Initializing => "Initializing",
            SagaStatus::Running => "Running",
            SagaStatus::Completing => "Completing",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initializing" => Ok(SagaStatus::Initializing),
            "Running" => Ok(SagaStatus::Running),
            "Completing" => Ok(SagaStatus::Completing),
            "Compensating" => Ok(SagaStatus::Compensating),
            "Completed" => Ok(SagaStatus::Completed),
            "Compensated" => Ok(SagaStatus::Compensated),
            "Failed" => Ok(SagaStatus::Failed),
            other => Err(SagaError::Repository(format!("unknown saga status '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SagaStatus; 7] = [
        SagaStatus::Initializing,
        SagaStatus::Running,
        SagaStatus::Completing,
        SagaStatus::Compensating,
        SagaStatus::Completed,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    #[test]
    fn test_default_status_is_initializing() {
        assert_eq!(SagaStatus::default(), SagaStatus::Initializing);
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            [
                &SagaStatus::Completed,
                &SagaStatus::Compensated,
                &SagaStatus::Failed
            ]
        );
    }

    #[test]
    fn test_terminal_statuses_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_no_way_back_to_running() {
        assert!(!SagaStatus::Compensating.can_transition_to(SagaStatus::Running));
        assert!(!SagaStatus::Completing.can_transition_to(SagaStatus::Running));
        assert!(!SagaStatus::Completing.can_transition_to(SagaStatus::Compensating));
        assert!(!SagaStatus::Running.can_transition_to(SagaStatus::Completed));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("Paused".parse::<SagaStatus>().is_err());
    }
}
