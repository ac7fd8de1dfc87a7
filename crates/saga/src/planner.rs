//! Compensation planning.
//!
//! [`plan_compensation`] is a pure function of the definition and the
//! attempt history, so a plan computed after a restart matches the one the
//! previous driver would have computed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::record::{Direction, StepExecutionRecord};

/// The forward step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePoint {
    pub step_index: usize,
    /// The step may have applied its side effects despite failing.
    pub uncertain: bool,
}

/// Ordered rollback of a partially completed instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationPlan {
    /// Step indexes to compensate, in execution order.
    pub steps: Vec<usize>,
    /// Completed steps with no declared compensation.
    pub gaps: Vec<String>,
    /// Uncertain steps with no declared compensation.
    pub unresolved: Vec<String>,
}

/// Computes which compensations to run, and in what order.
///
/// Completed forward steps are undone in reverse completion order. An
/// uncertain failing step that was actually attempted is undone first.
/// Steps already compensated are skipped.
pub fn plan_compensation(
    definition: &SagaDefinition,
    records: &[StepExecutionRecord],
    failure: &FailurePoint,
) -> CompensationPlan {
    let compensated: HashSet<usize> = records
        .iter()
        .filter(|r| r.is_compensation_success())
        .map(|r| r.step_index)
        .collect();

    let mut completed: Vec<usize> = Vec::new();
    for record in records.iter().filter(|r| r.is_forward_success()) {
        if record.step_index != failure.step_index && !completed.contains(&record.step_index) {
            completed.push(record.step_index);
        }
    }

    let failing_started = records
        .iter()
        .any(|r| r.step_index == failure.step_index && r.direction == Direction::Forward);

    let mut candidates = Vec::with_capacity(completed.len() + 1);
    if failure.uncertain && failing_started {
        candidates.push(failure.step_index);
    }
    candidates.extend(completed.into_iter().rev());

    let mut plan = CompensationPlan::default();
    for index in candidates {
        if compensated.contains(&index) {
            continue;
        }
        let Some(step) = definition.step(index) else {
            continue;
        };
        if step.compensation.is_some() {
            plan.steps.push(index);
        } else if index == failure.step_index {
            plan.unresolved.push(step.name.clone());
        } else {
            plan.gaps.push(step.name.clone());
        }
    }

    plan
}
