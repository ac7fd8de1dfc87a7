//! Saga definitions: the immutable templates instances are created from.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::participants::{HttpOperation, Operation};

/// Retry behaviour of one step, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Exponential backoff yielding exactly `max_retries` delays.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// One step of a saga: a forward operation and its optional compensation.
#[derive(Clone)]
pub struct StepSpec {
    pub name: String,
    pub forward: Arc<dyn Operation>,
    /// `None` for side effects that cannot be undone (e.g. a sent email).
    pub compensation: Option<Arc<dyn Operation>>,
    /// Saga-level deadline of the step, measured from its start.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// The forward operation may have applied even when it reports a
    /// permanent failure, so the step is compensated too.
    pub side_effects_on_failure: bool,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, forward: Arc<dyn Operation>) -> Self {
        Self {
            name: name.into(),
            forward,
            compensation: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            side_effects_on_failure: false,
        }
    }

    pub fn compensate_with(mut self, compensation: Arc<dyn Operation>) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn side_effects_on_failure(mut self) -> Self {
        self.side_effects_on_failure = true;
        self
    }
}

impl std::fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSpec")
            .field("name", &self.name)
            .field("forward", &self.forward.name())
            .field("compensation", &self.compensation.as_ref().map(|c| c.name()))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("side_effects_on_failure", &self.side_effects_on_failure)
            .finish()
    }
}

/// An ordered list of steps under a unique name.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub name: String,
    pub steps: Vec<StepSpec>,
}

impl SagaDefinition {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Checks the definition against the coordinator's per-call timeout.
    pub fn validate(&self, call_timeout: Duration) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "definition name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "'{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "'{}' declares step '{}' twice",
                    self.name, step.name
                )));
            }
            if step.timeout <= call_timeout {
                return Err(SagaError::InvalidDefinition(format!(
                    "step '{}' timeout {:?} must exceed the call timeout {:?}",
                    step.name, step.timeout, call_timeout
                )));
            }
        }

        Ok(())
    }
}

pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<StepSpec>,
}

impl SagaDefinitionBuilder {
    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Builds the definition. Timeouts are checked at registration, once
    /// the call timeout is known.
    pub fn build(self) -> Result<SagaDefinition> {
        let definition = SagaDefinition {
            name: self.name,
            steps: self.steps,
        };
        definition.validate(Duration::ZERO)?;
        Ok(definition)
    }
}

/// Registered definitions by name.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, replacing one with the same name.
    pub fn register(&self, definition: SagaDefinition) -> Arc<SagaDefinition> {
        let definition = Arc::new(definition);
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.name.clone(), Arc::clone(&definition));
        definition
    }

    pub fn get(&self, name: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All definitions, sorted by name.
    pub fn all(&self) -> Vec<Arc<SagaDefinition>> {
        let mut all: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

/// A saga definition as data, with participants named by URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDocument {
    pub name: String,
    pub steps: Vec<StepDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDocument {
    pub name: String,
    pub forward_url: String,
    #[serde(default)]
    pub compensation_url: Option<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub side_effects_on_failure: bool,
}

impl DefinitionDocument {
    /// Resolves every URL into an [`HttpOperation`] sharing `client`.
    pub fn resolve(&self, client: &reqwest::Client) -> Result<SagaDefinition> {
        let mut builder = SagaDefinition::builder(&self.name);

        for step in &self.steps {
            let defaults = RetryPolicy::default();
            let min_delay = step
                .min_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.min_delay);
            let max_delay = step
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay);
            let retry = defaults
                .with_max_retries(step.max_retries.unwrap_or(defaults.max_retries))
                .with_delays(min_delay, max_delay);

            let forward = HttpOperation::new(
                format!("{}.forward", step.name),
                &step.forward_url,
                client.clone(),
            );
            let mut spec = StepSpec::new(&step.name, Arc::new(forward))
                .timeout(Duration::from_millis(step.timeout_ms))
                .retry(retry);
            if let Some(url) = &step.compensation_url {
                let compensation =
                    HttpOperation::new(format!("{}.compensate", step.name), url, client.clone());
                spec = spec.compensate_with(Arc::new(compensation));
            }
            if step.side_effects_on_failure {
                spec = spec.side_effects_on_failure();
            }

            builder = builder.step(spec);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participants::InMemoryParticipant;
    use backon::BackoffBuilder;

    fn step(name: &str) -> StepSpec {
        StepSpec::new(name, InMemoryParticipant::new(name).operation())
            .timeout(Duration::from_secs(10))
    }

    #[test]
    fn test_definition_needs_steps() {
        let result = SagaDefinition::builder("empty").build();
        assert!(matches!(result, Err(SagaError::InvalidDefinition(_))));
    }

    #[test]
    fn test_step_names_must_be_unique() {
        let result = SagaDefinition::builder("dup")
            .step(step("create_base"))
            .step(step("create_base"))
            .build();
        assert!(matches!(result, Err(SagaError::InvalidDefinition(_))));
    }

    #[test]
    fn test_step_timeout_must_exceed_call_timeout() {
        let definition = SagaDefinition::builder("provision")
            .step(step("create_base"))
            .build()
            .unwrap();

        assert!(definition.validate(Duration::from_secs(5)).is_ok());
        assert!(definition.validate(Duration::from_secs(10)).is_err());
    }

    #[test]
    fn test_backoff_yields_max_retries_delays() {
        let policy = RetryPolicy::default()
            .with_max_retries(2)
            .with_delays(Duration::from_millis(10), Duration::from_millis(40))
            .without_jitter();

        let delays: Vec<_> = policy.backoff().build().collect();
        assert_eq!(delays.len(), 2);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));
        assert_eq!(RetryPolicy::none().backoff().build().count(), 0);
    }

    #[test]
    fn test_registry_replaces_by_name() {
        let registry = DefinitionRegistry::new();
        registry.register(
            SagaDefinition::builder("provision")
                .step(step("a"))
                .build()
                .unwrap(),
        );
        registry.register(
            SagaDefinition::builder("provision")
                .step(step("a"))
                .step(step("b"))
                .build()
                .unwrap(),
        );
        registry.register(
            SagaDefinition::builder("import")
                .step(step("a"))
                .build()
                .unwrap(),
        );

        assert_eq!(registry.get("provision").unwrap().len(), 2);
        assert!(registry.get("missing").is_none());
        let names: Vec<_> = registry.all().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, ["import", "provision"]);
    }

    #[test]
    fn test_document_resolves_to_http_operations() {
        let json = serde_json::json!({
            "name": "provision-workspace",
            "steps": [
                {
                    "name": "create_base",
                    "forward_url": "http://airtable-gateway/bases",
                    "compensation_url": "http://airtable-gateway/bases/delete",
                    "timeout_ms": 30000,
                    "max_retries": 2
                },
                {
                    "name": "notify_owner",
                    "forward_url": "http://notifications/send",
                    "timeout_ms": 10000
                }
            ]
        });
        let document: DefinitionDocument = serde_json::from_value(json).unwrap();
        let definition = document.resolve(&reqwest::Client::new()).unwrap();

        assert_eq!(definition.name, "provision-workspace");
        let create = definition.step(0).unwrap();
        assert_eq!(create.forward.name(), "create_base.forward");
        assert_eq!(create.retry.max_retries, 2);
        assert!(create.compensation.is_some());
        assert!(definition.step(1).unwrap().compensation.is_none());
        assert_eq!(definition.step(1).unwrap().timeout, Duration::from_secs(10));
    }
}
