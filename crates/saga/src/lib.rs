//! Saga orchestration for multi-step distributed operations.
//!
//! A saga runs the steps of a [`SagaDefinition`] in order, calling remote
//! participants through [`Operation`]s. When a step fails permanently, runs
//! out of retries, times out or is aborted, the steps that already completed
//! are compensated in reverse order.
//!
//! Every transition is recorded in the event store before the next side
//! effect is attempted, so an instance's state can always be rebuilt by
//! replaying its events and a restarted coordinator resumes where the
//! previous one stopped.

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod definition;
mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod participants;
pub mod planner;
pub mod postgres;
pub mod record;
pub mod registry;
pub mod repository;
pub mod state;
pub mod timeouts;

pub use aggregate::{NextAction, SagaInstance};
pub use config::CoordinatorConfig;
pub use coordinator::{RecoveryReport, SagaCoordinator, SagaStatusReport, SubmitSaga};
pub use definition::{
    DefinitionDocument, DefinitionRegistry, RetryPolicy, SagaDefinition, StepDocument, StepSpec,
};
pub use error::{Result, SagaError};
pub use events::{FailureReason, SagaEvent};
pub use executor::{AttemptSink, Interrupt, StepExecutor, StepOutcome, StepRequest};
pub use participants::{
    ErrorClass, ErrorClassifier, HttpOperation, InMemoryParticipant, Operation, ParticipantCall,
    ParticipantError, default_classifier,
};
pub use planner::{CompensationPlan, FailurePoint, plan_compensation};
pub use postgres::PostgresSagaRepository;
pub use record::{AttemptStatus, Direction, StepExecutionRecord, TimeoutEntry};
pub use registry::{InstanceRegistry, Signal};
pub use repository::{InMemorySagaRepository, InstanceRow, SagaRepository};
pub use state::SagaStatus;
pub use timeouts::{TimeoutRegistry, TimeoutSweeper};
