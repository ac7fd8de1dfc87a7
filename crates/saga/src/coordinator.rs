//! Saga coordinator: submission, status, abort and crash recovery.
//!
//! Every instance is driven by exactly one task, claimed through the
//! [`InstanceRegistry`]. Because each transition is persisted before it is
//! acted on, a restarted process resumes from the ledger with
//! [`SagaCoordinator::recover`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::InstanceId;
use event_store::{
    AppendOptions, EventEnvelope, EventStore, EventStoreError, EventStoreExt, SequenceNumber,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregate::{CompensationProgress, InFlightStep, SagaInstance, StepError, StepFailure};
use crate::config::CoordinatorConfig;
use crate::definition::{DefinitionRegistry, SagaDefinition};
use crate::driver::{Driver, envelope};
use crate::error::{Result, SagaError};
use crate::events::{SagaEvent, SagaStartedData};
use crate::executor::StepExecutor;
use crate::participants::{ErrorClassifier, default_classifier};
use crate::record::StepExecutionRecord;
use crate::registry::{InstanceRegistry, Signal};
use crate::repository::{InstanceRow, SagaRepository};
use crate::state::SagaStatus;
use crate::timeouts::{TimeoutRegistry, TimeoutSweeper};

/// A request to start a new instance of a registered definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSaga {
    pub definition: String,
    /// Submissions sharing a key resolve to the same instance.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Defaults to the instance id.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub initiator: String,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl SubmitSaga {
    pub fn new(definition: impl Into<String>, initiator: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            idempotency_key: None,
            correlation_id: None,
            initiator: initiator.into(),
            context: serde_json::Map::new(),
        }
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn context(mut self, context: serde_json::Map<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }
}

/// Read-only view of an instance, with its full event history.
#[derive(Debug, Clone, Serialize)]
pub struct SagaStatusReport {
    pub instance_id: InstanceId,
    pub definition_name: String,
    pub status: SagaStatus,
    pub current_step: usize,
    pub step_count: usize,
    pub correlation_id: String,
    pub initiator: String,
    pub context: serde_json::Map<String, serde_json::Value>,
    /// The step whose call is in flight, with its deadline.
    pub active_step: Option<InFlightStep>,
    pub failure: Option<StepFailure>,
    pub compensation: Option<CompensationProgress>,
    /// For `Failed` instances, the step that could not be undone.
    pub terminal_error: Option<StepError>,
    pub frozen: bool,
    pub frozen_reason: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub events: Vec<EventEnvelope>,
}

impl SagaStatusReport {
    fn new(
        instance_id: InstanceId,
        instance: SagaInstance,
        row: Option<InstanceRow>,
        events: Vec<EventEnvelope>,
    ) -> Self {
        let (frozen, frozen_reason) = row
            .map(|row| (row.frozen, row.frozen_reason))
            .unwrap_or((false, None));
        Self {
            instance_id,
            definition_name: instance.definition_name().to_string(),
            status: instance.status(),
            current_step: instance.current_step(),
            step_count: instance.step_count(),
            correlation_id: instance.correlation_id().to_string(),
            initiator: instance.initiator().to_string(),
            context: instance.context().clone(),
            active_step: instance.in_flight().cloned(),
            failure: instance.failure().cloned(),
            compensation: instance.compensation().cloned(),
            terminal_error: instance.terminal_error().cloned(),
            frozen,
            frozen_reason,
            created_at: instance.created_at(),
            updated_at: instance.updated_at(),
            events,
        }
    }
}

/// Outcome of a boot-time recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Non-terminal instances found in the ledger.
    pub scanned: usize,
    pub resumed: usize,
    /// Live, frozen, or without a matching definition.
    pub skipped: usize,
}

pub(crate) struct Inner<S, R> {
    pub(crate) store: S,
    pub(crate) repository: R,
    pub(crate) definitions: DefinitionRegistry,
    pub(crate) instances: Arc<InstanceRegistry>,
    pub(crate) timeouts: Arc<TimeoutRegistry>,
    pub(crate) executor: StepExecutor,
    pub(crate) config: CoordinatorConfig,
}

/// Orchestrates saga instances over an event store and a repository.
pub struct SagaCoordinator<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for SagaCoordinator<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, R> SagaCoordinator<S, R>
where
    S: EventStore + 'static,
    R: SagaRepository + 'static,
{
    pub fn new(store: S, repository: R, config: CoordinatorConfig) -> Self {
        Self::with_classifier(store, repository, config, default_classifier())
    }

    /// Uses `classifier` to decide which participant errors are retried.
    pub fn with_classifier(
        store: S,
        repository: R,
        config: CoordinatorConfig,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                repository,
                definitions: DefinitionRegistry::new(),
                instances: Arc::new(InstanceRegistry::new()),
                timeouts: Arc::new(TimeoutRegistry::new(config.timeout_shards)),
                executor: StepExecutor::with_classifier(config.call_timeout, classifier),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn repository(&self) -> &R {
        &self.inner.repository
    }

    /// Validates and registers a definition, replacing one with the same name.
    pub fn register_definition(&self, definition: SagaDefinition) -> Result<Arc<SagaDefinition>> {
        definition.validate(self.inner.config.call_timeout)?;
        info!(
            definition = %definition.name,
            steps = definition.len(),
            "saga definition registered"
        );
        Ok(self.inner.definitions.register(definition))
    }

    pub fn definition(&self, name: &str) -> Option<Arc<SagaDefinition>> {
        self.inner.definitions.get(name)
    }

    pub fn definitions(&self) -> Vec<Arc<SagaDefinition>> {
        self.inner.definitions.all()
    }

    /// Instances driven by this process right now.
    pub fn active_instances(&self) -> Vec<InstanceId> {
        self.inner.instances.active_ids()
    }

    /// Number of armed step deadlines.
    pub fn armed_timeouts(&self) -> usize {
        self.inner.timeouts.len()
    }

    /// Starts a new instance and returns its id once `SagaStarted` is durable.
    ///
    /// A submission repeating an earlier idempotency key returns the id of
    /// the existing instance without creating a second one.
    #[tracing::instrument(skip(self, request), fields(definition = %request.definition))]
    pub async fn submit(&self, request: SubmitSaga) -> Result<InstanceId> {
        let definition = self
            .inner
            .definitions
            .get(&request.definition)
            .ok_or_else(|| SagaError::UnknownDefinition(request.definition.clone()))?;

        let instance_id = match &request.idempotency_key {
            Some(key) => InstanceId::for_submission(&definition.name, key),
            None => InstanceId::new(),
        };
        let correlation_id = request
            .correlation_id
            .unwrap_or_else(|| instance_id.to_string());

        let event = SagaEvent::SagaStarted(SagaStartedData {
            definition_name: definition.name.clone(),
            step_count: definition.len(),
            correlation_id: correlation_id.clone(),
            initiator: request.initiator.clone(),
            idempotency_key: request.idempotency_key.clone(),
            context: request.context,
            started_at: Utc::now(),
        });
        let started = envelope(
            instance_id,
            SequenceNumber::first(),
            &event,
            &correlation_id,
            &request.initiator,
        )?;

        match self
            .inner
            .store
            .append(vec![started.clone()], AppendOptions::expect_new())
            .await
        {
            Ok(_) => {}
            Err(EventStoreError::ConcurrencyConflict { .. }) if request.idempotency_key.is_some() => {
                metrics::counter!("saga_duplicate_submissions_total").increment(1);
                info!(%instance_id, "duplicate submission, returning existing instance");
                return Ok(instance_id);
            }
            Err(e) => {
                error!(%instance_id, error = %e, "failed to persist saga start");
                return Err(e.into());
            }
        }

        metrics::counter!("saga_submissions_total").increment(1);
        info!(%instance_id, %correlation_id, initiator = %request.initiator, "saga submitted");

        let mut instance = SagaInstance::default();
        instance.apply_envelope(&started)?;
        self.spawn_driver(instance, definition);
        Ok(instance_id)
    }

    /// Current state of an instance, rebuilt from its full event history.
    #[tracing::instrument(skip(self))]
    pub async fn status(&self, instance_id: InstanceId) -> Result<Option<SagaStatusReport>> {
        let events = self.inner.store.load_events(instance_id).await?;
        if events.is_empty() {
            return Ok(None);
        }
        let instance = SagaInstance::replay(None, &events)?;
        let row = self.inner.repository.get_instance(instance_id).await?;
        Ok(Some(SagaStatusReport::new(instance_id, instance, row, events)))
    }

    pub async fn events(&self, instance_id: InstanceId) -> Result<Vec<EventEnvelope>> {
        let events = self.inner.store.load_events(instance_id).await?;
        if events.is_empty() {
            return Err(SagaError::NotFound(instance_id));
        }
        Ok(events)
    }

    /// Every attempt record of an instance, forward and compensating.
    ///
    /// Read from the ledger, which holds attempts the repository projection
    /// may have missed before a restart.
    pub async fn executions(&self, instance_id: InstanceId) -> Result<Vec<StepExecutionRecord>> {
        let events = self.inner.store.load_events(instance_id).await?;
        if events.is_empty() {
            return Err(SagaError::NotFound(instance_id));
        }
        let instance = SagaInstance::replay(None, &events)?;
        Ok(instance.records().to_vec())
    }

    /// Rebuilds an instance from its latest snapshot and the events after it.
    pub async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<SagaInstance>> {
        let (snapshot, events) = self.inner.store.load_stream(instance_id).await?;
        if snapshot.is_none() && events.is_empty() {
            return Ok(None);
        }
        SagaInstance::replay(snapshot, &events).map(Some)
    }

    /// Fails the current step of a running instance and compensates it.
    ///
    /// The abort is recorded as an event by the instance driver.
    #[tracing::instrument(skip(self, reason, requested_by))]
    pub async fn abort(
        &self,
        instance_id: InstanceId,
        reason: impl Into<String> + Send,
        requested_by: impl Into<String> + Send,
    ) -> Result<()> {
        let instance = self
            .load_instance(instance_id)
            .await?
            .ok_or(SagaError::NotFound(instance_id))?;
        if instance.status() != SagaStatus::Running {
            return Err(SagaError::InvalidState {
                expected: SagaStatus::Running.to_string(),
                actual: instance.status(),
            });
        }
        // Once a step has failed the driver only compensates.
        if instance.failure().is_some() {
            return Err(SagaError::InvalidState {
                expected: "Running with no failed step".to_string(),
                actual: instance.status(),
            });
        }

        let signal = Signal::Abort {
            reason: reason.into(),
            requested_by: requested_by.into(),
        };
        if !self.inner.instances.signal(instance_id, signal) {
            return Err(SagaError::NotRunning(instance_id));
        }

        metrics::counter!("saga_aborts_total").increment(1);
        info!(%instance_id, "abort requested");
        Ok(())
    }

    /// Resolves once the instance is terminal, or its driver has stopped.
    pub async fn wait_for_terminal(&self, instance_id: InstanceId) -> Result<SagaStatus> {
        if let Some(mut status) = self.inner.instances.subscribe(instance_id) {
            loop {
                let current = *status.borrow_and_update();
                if current.is_terminal() {
                    return Ok(current);
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
        }

        let instance = self
            .load_instance(instance_id)
            .await?
            .ok_or(SagaError::NotFound(instance_id))?;
        Ok(instance.status())
    }

    /// Resumes every non-terminal instance in the event store.
    ///
    /// Steps that were in flight when the previous process stopped are
    /// failed as unknown and compensated.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut stream = self.inner.store.stream_all_events().await?;
        let mut seen = HashSet::new();
        let mut terminal = HashSet::new();
        let mut order = Vec::new();
        while let Some(envelope) = stream.next().await {
            let envelope = envelope?;
            if seen.insert(envelope.instance_id) {
                order.push(envelope.instance_id);
            }
            if SagaEvent::is_terminal_type(&envelope.event_type) {
                terminal.insert(envelope.instance_id);
            }
        }

        let mut report = RecoveryReport::default();
        for instance_id in order.into_iter().filter(|id| !terminal.contains(id)) {
            report.scanned += 1;

            if self.inner.instances.is_live(instance_id) {
                report.skipped += 1;
                continue;
            }
            if let Some(row) = self.inner.repository.get_instance(instance_id).await?
                && row.frozen
            {
                warn!(%instance_id, reason = ?row.frozen_reason, "skipping frozen instance");
                report.skipped += 1;
                continue;
            }

            let Some(instance) = self.load_instance(instance_id).await? else {
                continue;
            };
            let definition = self
                .inner
                .definitions
                .get(instance.definition_name())
                .filter(|definition| definition.len() == instance.step_count());
            let Some(definition) = definition else {
                warn!(
                    %instance_id,
                    definition = instance.definition_name(),
                    "no matching definition registered, instance left as is"
                );
                report.skipped += 1;
                continue;
            };

            if self.spawn_driver(instance, definition) {
                metrics::counter!("saga_recovered_total").increment(1);
                report.resumed += 1;
            } else {
                report.skipped += 1;
            }
        }

        info!(
            scanned = report.scanned,
            resumed = report.resumed,
            skipped = report.skipped,
            "recovery scan finished"
        );
        Ok(report)
    }

    /// Starts the background task that fires expired step deadlines.
    pub fn spawn_timeout_sweeper(&self) -> JoinHandle<()> {
        let sweeper = TimeoutSweeper::new(
            Arc::clone(&self.inner.timeouts),
            Arc::clone(&self.inner.instances),
            self.inner.config.sweep_interval,
        );
        tokio::spawn(sweeper.run())
    }

    /// Claims the instance and spawns its driver. Returns false if another
    /// driver already owns it.
    fn spawn_driver(&self, instance: SagaInstance, definition: Arc<SagaDefinition>) -> bool {
        let Some(instance_id) = instance.id() else {
            return false;
        };
        let Some(handle) = self.inner.instances.claim(instance_id, instance.status()) else {
            debug!(%instance_id, "instance already has a live driver");
            return false;
        };

        let driver = Driver::new(
            Arc::clone(&self.inner),
            instance_id,
            definition,
            instance,
            handle,
        );
        tokio::spawn(driver.run());
        true
    }
}

