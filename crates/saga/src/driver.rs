//! The per-instance driver task.
//!
//! A driver is the single writer of its instance. It derives the next
//! action from the replayed state, persists the transition, and only then
//! calls participants for the following step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::InstanceId;
use event_store::{AppendOptions, EventEnvelope, EventStore, SequenceNumber, Snapshot};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::aggregate::{NextAction, SagaInstance, StepError};
use crate::coordinator::Inner;
use crate::definition::{SagaDefinition, StepSpec};
use crate::error::{Result, SagaError};
use crate::events::*;
use crate::executor::{AttemptSink, Interrupt, StepOutcome, StepRequest};
use crate::participants::ErrorClass;
use crate::planner::{FailurePoint, plan_compensation};
use crate::record::{AttemptStatus, Direction, StepExecutionRecord, TimeoutEntry};
use crate::registry::{InstanceHandle, Signal};
use crate::repository::{InstanceRow, SagaRepository};
use crate::state::SagaStatus;

pub(crate) fn envelope(
    instance_id: InstanceId,
    sequence: SequenceNumber,
    event: &SagaEvent,
    correlation_id: &str,
    initiator: &str,
) -> Result<EventEnvelope> {
    Ok(EventEnvelope::builder()
        .instance_id(instance_id)
        .sequence(sequence)
        .event_type(event.event_type())
        .payload(event)?
        .metadata("correlation_id", correlation_id.into())
        .metadata("initiator", initiator.into())
        .build())
}

fn deadline_after(timeout: Duration) -> DateTime<Utc> {
    chrono::TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The single writer of one instance.
pub(crate) struct Driver<S, R> {
    inner: Arc<Inner<S, R>>,
    instance_id: InstanceId,
    definition: Arc<SagaDefinition>,
    instance: SagaInstance,
    mailbox: mpsc::UnboundedReceiver<Signal>,
    status: watch::Sender<SagaStatus>,
    since_snapshot: usize,
}

impl<S, R> Driver<S, R>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    pub(crate) fn new(
        inner: Arc<Inner<S, R>>,
        instance_id: InstanceId,
        definition: Arc<SagaDefinition>,
        instance: SagaInstance,
        handle: InstanceHandle,
    ) -> Self {
        Self {
            inner,
            instance_id,
            definition,
            instance,
            mailbox: handle.mailbox,
            status: handle.status,
            since_snapshot: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        let instance_id = self.instance_id;
        match self.drive().await {
            Ok(()) => {}
            Err(SagaError::ConcurrencyViolation {
                expected, actual, ..
            }) => {
                let reason = format!(
                    "concurrent writer detected: expected sequence {expected}, found {actual}"
                );
                error!(%instance_id, %reason, "instance frozen");
                if let Err(e) = self
                    .inner
                    .repository
                    .flag_frozen(instance_id, &reason)
                    .await
                {
                    error!(%instance_id, error = %e, "failed to flag frozen instance");
                }
            }
            Err(e) => {
                error!(
                    %instance_id,
                    status = %self.instance.status(),
                    error = %e,
                    "instance driver stopped"
                );
            }
        }

        if let Some(in_flight) = self.instance.in_flight() {
            self.inner.timeouts.disarm(instance_id, in_flight.step_index);
        }
        self.inner.instances.release(instance_id);
    }

    async fn drive(&mut self) -> Result<()> {
        self.project_instance().await;
        loop {
            match self.instance.next_action() {
                NextAction::Execute(index) => self.execute_step(index).await?,
                NextAction::ResolveUnknown(index) => self.resolve_unknown(index).await?,
                NextAction::PlanCompensation => self.start_compensation().await?,
                NextAction::Compensate(index) => self.compensate_step(index).await?,
                NextAction::Complete => self.append(vec![SagaEvent::saga_completed()]).await?,
                NextAction::FinishCompensated => {
                    self.append(vec![SagaEvent::saga_compensated()]).await?
                }
                NextAction::FinishFailed => {
                    let failed = self.unrecoverable_step();
                    self.append(vec![SagaEvent::saga_failed(
                        failed.step_index,
                        failed.step_name,
                        failed.error,
                    )])
                    .await?
                }
                NextAction::Done => {
                    self.finish();
                    return Ok(());
                }
            }
        }
    }

    fn step(&self, index: usize) -> Result<StepSpec> {
        self.definition.step(index).cloned().ok_or_else(|| {
            SagaError::InvalidDefinition(format!(
                "'{}' has no step {index}",
                self.definition.name
            ))
        })
    }

    async fn execute_step(&mut self, index: usize) -> Result<()> {
        let step = self.step(index)?;

        // An abort that arrived between steps fails this one before it starts.
        while let Ok(signal) = self.mailbox.try_recv() {
            if let Signal::Abort {
                reason,
                requested_by,
            } = signal
            {
                return self
                    .append(aborted(index, &step.name, reason, requested_by, None))
                    .await;
            }
        }

        let deadline = deadline_after(step.timeout);
        self.append(vec![SagaEvent::StepStarted(StepStartedData {
            step_index: index,
            step_name: step.name.clone(),
            deadline,
        })])
        .await?;
        self.inner.timeouts.arm(TimeoutEntry {
            instance_id: self.instance_id,
            step_index: index,
            deadline,
        });
        debug!(instance_id = %self.instance_id, step = %step.name, %deadline, "step started");

        let request = StepRequest {
            instance_id: self.instance_id,
            correlation_id: self.instance.correlation_id().to_string(),
            step_index: index,
            step_name: step.name.clone(),
            direction: Direction::Forward,
            operation: Arc::clone(&step.forward),
            retry: step.retry,
            context: self.instance.context().clone(),
        };
        let executor = self.inner.executor.clone();
        let outcome = executor
            .execute(
                request,
                &mut DriverSink {
                    driver: &mut *self,
                    step_index: index,
                    direction: Direction::Forward,
                },
            )
            .await;
        self.inner.timeouts.disarm(self.instance_id, index);

        let events = match outcome? {
            StepOutcome::Succeeded { payload, record } => {
                info!(
                    instance_id = %self.instance_id,
                    step = %step.name,
                    attempt = record.attempt,
                    "step completed"
                );
                vec![SagaEvent::StepCompleted(StepCompletedData {
                    record,
                    output: payload,
                })]
            }
            StepOutcome::Failed {
                error,
                class,
                attempts,
            } => {
                let error = SagaError::step_failure(&step.name, &error, class);
                warn!(instance_id = %self.instance_id, attempts, error = %error, "step failed");
                let reason = match class {
                    ErrorClass::Transient => FailureReason::RetriesExhausted,
                    ErrorClass::Permanent => FailureReason::Permanent,
                };
                vec![step_failed(index, &step.name, reason, error.to_string(), None)]
            }
            StepOutcome::Interrupted {
                interrupt: Interrupt::TimedOut,
                record,
            } => {
                let error = SagaError::Timeout {
                    step: step.name.clone(),
                };
                warn!(instance_id = %self.instance_id, error = %error, "step deadline expired");
                vec![step_failed(
                    index,
                    &step.name,
                    FailureReason::TimedOut,
                    error.to_string(),
                    record,
                )]
            }
            StepOutcome::Interrupted {
                interrupt:
                    Interrupt::Aborted {
                        reason,
                        requested_by,
                    },
                record,
            } => aborted(index, &step.name, reason, requested_by, record),
        };
        self.append(events).await
    }

    /// Fails a step whose call was in flight when the previous driver stopped.
    async fn resolve_unknown(&mut self, index: usize) -> Result<()> {
        let step = self.step(index)?;
        let now = Utc::now();
        let record = StepExecutionRecord {
            instance_id: self.instance_id,
            step_index: index,
            step_name: step.name.clone(),
            direction: Direction::Forward,
            attempt: self.instance.forward_attempts(index) + 1,
            status: AttemptStatus::Unknown,
            started_at: now,
            completed_at: Some(now),
            error: Some("no outcome recorded before restart".to_string()),
            result: None,
        };
        warn!(instance_id = %self.instance_id, step = %step.name, "step outcome unknown after restart");
        self.append(vec![step_failed(
            index,
            &step.name,
            FailureReason::Unknown,
            "outcome unknown: the coordinator stopped while the step was in flight".to_string(),
            Some(record),
        )])
        .await
    }

    async fn start_compensation(&mut self) -> Result<()> {
        let failure = self
            .instance
            .failure()
            .cloned()
            .ok_or_else(|| SagaError::InvalidState {
                expected: "a failed step".to_string(),
                actual: self.instance.status(),
            })?;
        let step = self.step(failure.step_index)?;
        let by_reason = match failure.reason {
            FailureReason::TimedOut | FailureReason::Unknown => true,
            FailureReason::Aborted => failure.interrupted_mid_call,
            FailureReason::Permanent | FailureReason::RetriesExhausted => {
                step.side_effects_on_failure
            }
        };
        // Any earlier attempt that went unanswered may have applied too.
        let uncertain = by_reason
            || self.instance.records().iter().any(|r| {
                r.direction == Direction::Forward
                    && r.step_index == failure.step_index
                    && r.outcome_unknown()
            });

        let plan = plan_compensation(
            &self.definition,
            self.instance.records(),
            &FailurePoint {
                step_index: failure.step_index,
                uncertain,
            },
        );
        for gap in &plan.gaps {
            warn!(
                instance_id = %self.instance_id,
                step = %gap,
                "completed step has no compensation, its side effects remain"
            );
        }
        for step in &plan.unresolved {
            warn!(
                instance_id = %self.instance_id,
                step = %step,
                "step may have applied and has no compensation"
            );
        }
        info!(
            instance_id = %self.instance_id,
            failed_step = %failure.step_name,
            plan = ?plan.steps,
            "compensation started"
        );

        self.append(vec![SagaEvent::CompensationStarted(
            CompensationStartedData {
                failed_step: failure.step_index,
                plan: plan.steps,
                gaps: plan.gaps,
                unresolved: plan.unresolved,
            },
        )])
        .await
    }

    async fn compensate_step(&mut self, index: usize) -> Result<()> {
        let step = self.step(index)?;
        let operation = step.compensation.clone().ok_or_else(|| {
            SagaError::InvalidDefinition(format!("step '{}' has no compensation", step.name))
        })?;

        let request = StepRequest {
            instance_id: self.instance_id,
            correlation_id: self.instance.correlation_id().to_string(),
            step_index: index,
            step_name: step.name.clone(),
            direction: Direction::Compensate,
            operation,
            retry: step.retry,
            context: self.instance.context().clone(),
        };
        let executor = self.inner.executor.clone();
        let outcome = executor
            .execute(
                request,
                &mut DriverSink {
                    driver: &mut *self,
                    step_index: index,
                    direction: Direction::Compensate,
                },
            )
            .await?;

        match outcome {
            StepOutcome::Succeeded { record, .. } => {
                info!(instance_id = %self.instance_id, step = %step.name, "step compensated");
                self.append(vec![SagaEvent::CompensationStepCompleted(AttemptData {
                    record,
                })])
                .await
            }
            StepOutcome::Failed {
                error, attempts, ..
            } => {
                let error = SagaError::CompensationFailed {
                    step: step.name.clone(),
                    message: error.to_string(),
                };
                error!(instance_id = %self.instance_id, attempts, error = %error, "compensation failed");
                self.append(vec![SagaEvent::CompensationStepFailed(
                    CompensationStepFailedData {
                        step_index: index,
                        step_name: step.name.clone(),
                        error: error.to_string(),
                    },
                )])
                .await
            }
            // Compensations are never interrupted; the step runs again.
            StepOutcome::Interrupted { .. } => Ok(()),
        }
    }

    /// The step reported by `SagaFailed`.
    fn unrecoverable_step(&self) -> StepError {
        let compensation = self.instance.compensation();
        if let Some(failed) = compensation.and_then(|c| c.failure.clone()) {
            return failed;
        }
        match self.instance.failure() {
            Some(failure) => StepError {
                step_index: failure.step_index,
                step_name: failure.step_name.clone(),
                error: format!(
                    "step may have applied and has no compensation: {}",
                    failure.error
                ),
            },
            None => StepError {
                step_index: self.instance.current_step(),
                step_name: String::new(),
                error: "compensation could not be completed".to_string(),
            },
        }
    }

    fn finish(&self) {
        let status = self.instance.status();
        match status {
            SagaStatus::Completed => metrics::counter!("saga_completed_total").increment(1),
            SagaStatus::Compensated => metrics::counter!("saga_compensated_total").increment(1),
            SagaStatus::Failed => metrics::counter!("saga_failed_total").increment(1),
            _ => {}
        }
        if let (Some(created), Some(updated)) =
            (self.instance.created_at(), self.instance.updated_at())
        {
            let duration = (updated - created).to_std().unwrap_or_default();
            metrics::histogram!("saga_duration_seconds").record(duration.as_secs_f64());
        }

        match self.instance.terminal_error() {
            Some(failed) => error!(
                instance_id = %self.instance_id,
                step = %failed.step_name,
                error = %failed.error,
                "saga failed, manual intervention required"
            ),
            None => info!(instance_id = %self.instance_id, %status, "saga finished"),
        }
    }

    /// Persists events, then applies and projects them.
    async fn append(&mut self, events: Vec<SagaEvent>) -> Result<()> {
        let expected = self.instance.sequence();
        let mut sequence = expected;
        let mut envelopes = Vec::with_capacity(events.len());
        for event in &events {
            sequence = sequence.next();
            envelopes.push(envelope(
                self.instance_id,
                sequence,
                event,
                self.instance.correlation_id(),
                self.instance.initiator(),
            )?);
        }

        self.inner
            .store
            .append(envelopes.clone(), AppendOptions::expect_sequence(expected))
            .await?;

        for (event, envelope) in events.iter().zip(&envelopes) {
            self.instance.apply_envelope(envelope)?;
            self.project_event(event).await;
        }
        self.project_instance().await;
        self.status.send_replace(self.instance.status());

        self.since_snapshot += envelopes.len();
        self.maybe_snapshot().await;
        Ok(())
    }

    async fn project_event(&self, event: &SagaEvent) {
        let repository = &self.inner.repository;
        let instance_id = self.instance_id;
        let result = async {
            if let Some(record) = event.execution_record() {
                repository.record_execution(record).await?;
            }
            match event {
                SagaEvent::StepStarted(data) => {
                    repository
                        .save_timeout(&TimeoutEntry {
                            instance_id,
                            step_index: data.step_index,
                            deadline: data.deadline,
                        })
                        .await
                }
                SagaEvent::StepCompleted(data) => {
                    repository
                        .delete_timeout(instance_id, data.record.step_index)
                        .await
                }
                SagaEvent::StepFailed(data) => {
                    repository.delete_timeout(instance_id, data.step_index).await
                }
                _ => Ok(()),
            }
        }
        .await;

        if let Err(e) = result {
            warn!(%instance_id, event = event.event_type(), error = %e, "failed to update saga projections");
        }
    }

    async fn project_instance(&self) {
        let Some(row) = InstanceRow::from_instance(&self.instance) else {
            return;
        };
        if let Err(e) = self.inner.repository.save_instance(&row).await {
            warn!(instance_id = %self.instance_id, error = %e, "failed to save instance row");
        }
    }

    async fn maybe_snapshot(&mut self) {
        let interval = self.inner.config.snapshot_interval;
        if interval == 0 || self.since_snapshot < interval {
            return;
        }
        self.since_snapshot = 0;

        let snapshot =
            match Snapshot::from_state(self.instance_id, self.instance.sequence(), &self.instance) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "failed to serialize snapshot");
                    return;
                }
            };
        if let Err(e) = self.inner.store.save_snapshot(snapshot).await {
            warn!(instance_id = %self.instance_id, error = %e, "failed to save snapshot");
        } else {
            debug!(instance_id = %self.instance_id, sequence = %self.instance.sequence(), "snapshot saved");
        }
    }
}

fn step_failed(
    step_index: usize,
    step_name: &str,
    reason: FailureReason,
    error: String,
    record: Option<StepExecutionRecord>,
) -> SagaEvent {
    SagaEvent::StepFailed(StepFailedData {
        step_index,
        step_name: step_name.to_string(),
        reason,
        error,
        record,
    })
}

fn aborted(
    step_index: usize,
    step_name: &str,
    reason: String,
    requested_by: String,
    record: Option<StepExecutionRecord>,
) -> Vec<SagaEvent> {
    let error = format!("aborted by {requested_by}: {reason}");
    vec![
        SagaEvent::AbortRequested(AbortRequestedData {
            step_index,
            reason,
            requested_by,
        }),
        step_failed(step_index, step_name, FailureReason::Aborted, error, record),
    ]
}

/// Records attempts as events and turns mailbox signals into interrupts.
struct DriverSink<'a, S, R> {
    driver: &'a mut Driver<S, R>,
    step_index: usize,
    direction: Direction,
}

#[async_trait]
impl<'a, S, R> AttemptSink for DriverSink<'a, S, R>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    async fn record_attempt(
        &mut self,
        record: &StepExecutionRecord,
        will_retry: bool,
    ) -> Result<()> {
        debug!(
            instance_id = %record.instance_id,
            step = %record.step_name,
            attempt = record.attempt,
            will_retry,
            "attempt failed"
        );
        let data = AttemptData {
            record: record.clone(),
        };
        let event = match self.direction {
            Direction::Forward => SagaEvent::StepAttemptFailed(data),
            Direction::Compensate => SagaEvent::CompensationAttemptFailed(data),
        };
        self.driver.append(vec![event]).await
    }

    async fn next_interrupt(&mut self) -> Interrupt {
        loop {
            let Some(signal) = self.driver.mailbox.recv().await else {
                return std::future::pending().await;
            };
            match signal {
                Signal::TimedOut { step_index }
                    if self.direction == Direction::Forward && step_index == self.step_index =>
                {
                    return Interrupt::TimedOut;
                }
                Signal::Abort {
                    reason,
                    requested_by,
                } if self.direction == Direction::Forward => {
                    return Interrupt::Aborted {
                        reason,
                        requested_by,
                    };
                }
                Signal::Abort { requested_by, .. } => warn!(
                    instance_id = %self.driver.instance_id,
                    %requested_by,
                    "abort arrived after forward execution ended, ignoring it"
                ),
                stale => debug!(?stale, "ignoring signal"),
            }
        }
    }
}
