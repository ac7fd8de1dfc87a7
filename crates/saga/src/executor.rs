//! Step execution with retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use chrono::Utc;
use common::InstanceId;
use tracing::{debug, warn};

use crate::definition::RetryPolicy;
use crate::error::Result;
use crate::participants::{
    ErrorClass, ErrorClassifier, Operation, ParticipantCall, ParticipantError,
    default_classifier,
};
use crate::record::{AttemptStatus, Direction, StepExecutionRecord};

/// Something that stops a step before its participant answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupt {
    TimedOut,
    Aborted { reason: String, requested_by: String },
}

/// Receives attempt records and delivers interrupts to the executor.
#[async_trait]
pub trait AttemptSink: Send {
    /// Durably records a failed attempt. Called before the executor sleeps
    /// for the next retry or gives up.
    async fn record_attempt(&mut self, record: &StepExecutionRecord, will_retry: bool)
    -> Result<()>;

    /// Resolves when the running step must stop. Must be cancel safe.
    async fn next_interrupt(&mut self) -> Interrupt;
}

/// One call of a step in one direction.
pub struct StepRequest {
    pub instance_id: InstanceId,
    pub correlation_id: String,
    pub step_index: usize,
    pub step_name: String,
    pub direction: Direction,
    pub operation: Arc<dyn Operation>,
    pub retry: RetryPolicy,
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub enum StepOutcome {
    Succeeded {
        payload: Option<serde_json::Value>,
        record: StepExecutionRecord,
    },
    /// The last attempt failed and no retry is left or allowed.
    Failed {
        error: ParticipantError,
        class: ErrorClass,
        attempts: u32,
    },
    /// `record` is set when a call was in flight at the interrupt.
    Interrupted {
        interrupt: Interrupt,
        record: Option<StepExecutionRecord>,
    },
}

/// Invokes participant operations with per-call timeouts and backoff.
#[derive(Clone)]
pub struct StepExecutor {
    call_timeout: Duration,
    classifier: ErrorClassifier,
}

impl StepExecutor {
    pub fn new(call_timeout: Duration) -> Self {
        Self::with_classifier(call_timeout, default_classifier())
    }

    pub fn with_classifier(call_timeout: Duration, classifier: ErrorClassifier) -> Self {
        Self {
            call_timeout,
            classifier,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Runs attempts until one succeeds, a permanent error or the retry
    /// budget stops it, or the sink delivers an interrupt.
    pub async fn execute<K: AttemptSink>(
        &self,
        request: StepRequest,
        sink: &mut K,
    ) -> Result<StepOutcome> {
        let mut backoff = request.retry.backoff().build();
        let idempotency_key = ParticipantCall::idempotency_key_for(
            request.instance_id,
            &request.step_name,
            request.direction,
        );
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started_at = Utc::now();
            let call = ParticipantCall {
                instance_id: request.instance_id,
                correlation_id: request.correlation_id.clone(),
                step_name: request.step_name.clone(),
                direction: request.direction,
                attempt_number: attempt,
                idempotency_key: idempotency_key.clone(),
                context: request.context.clone(),
            };
            let record = |status: AttemptStatus, error: Option<String>, result| StepExecutionRecord {
                instance_id: request.instance_id,
                step_index: request.step_index,
                step_name: request.step_name.clone(),
                direction: request.direction,
                attempt,
                status,
                started_at,
                completed_at: Some(Utc::now()),
                error,
                result,
            };

            metrics::counter!("saga_step_attempts_total", "direction" => request.direction.as_str())
                .increment(1);

            let invocation = tokio::time::timeout(self.call_timeout, request.operation.invoke(&call));
            tokio::pin!(invocation);

            let result = tokio::select! {
                biased;
                interrupt = sink.next_interrupt() => {
                    let status = match interrupt {
                        Interrupt::TimedOut => AttemptStatus::TimedOut,
                        Interrupt::Aborted { .. } => AttemptStatus::Aborted,
                    };
                    let record = record(status, Some(format!("{interrupt:?}")), None);
                    return Ok(StepOutcome::Interrupted {
                        interrupt,
                        record: Some(record),
                    });
                }
                result = &mut invocation => result.unwrap_or_else(|_| {
                    Err(ParticipantError::Timeout(format!(
                        "no response within {:?}",
                        self.call_timeout
                    )))
                }),
            };

            let error = match result {
                Ok(payload) => {
                    let record = record(AttemptStatus::Succeeded, None, payload.clone());
                    return Ok(StepOutcome::Succeeded { payload, record });
                }
                Err(error) => error,
            };

            let class = (self.classifier)(&error);
            let delay = match class {
                ErrorClass::Transient => backoff.next(),
                ErrorClass::Permanent => None,
            };

            // A call that outlived `call_timeout` may still have applied.
            let status = match error {
                ParticipantError::Timeout(_) => AttemptStatus::TimedOut,
                _ => AttemptStatus::Failed,
            };
            let failed = record(status, Some(error.to_string()), None);
            sink.record_attempt(&failed, delay.is_some()).await?;

            let Some(delay) = delay else {
                warn!(
                    step = %request.step_name,
                    direction = %request.direction,
                    attempt,
                    error = %error,
                    "giving up on step"
                );
                return Ok(StepOutcome::Failed {
                    error,
                    class,
                    attempts: attempt,
                });
            };

            debug!(
                step = %request.step_name,
                direction = %request.direction,
                attempt,
                ?delay,
                error = %error,
                "retrying step"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                interrupt = sink.next_interrupt() => {
                    return Ok(StepOutcome::Interrupted { interrupt, record: None });
                }
            }
        }
    }
}
