//! HTTP route handlers.

pub mod definitions;
pub mod health;
pub mod metrics;
pub mod sagas;

use std::sync::Arc;

use saga::SagaCoordinator;

/// Shared application state accessible from all handlers.
pub struct AppState<S, R> {
    pub coordinator: SagaCoordinator<S, R>,
}

pub type SharedState<S, R> = Arc<AppState<S, R>>;
