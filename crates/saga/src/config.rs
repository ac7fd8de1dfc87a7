//! Coordinator configuration.

use std::time::Duration;

/// Tuning knobs for a [`SagaCoordinator`](crate::SagaCoordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound of a single participant call. Every step timeout must be
    /// strictly greater.
    pub call_timeout: Duration,

    /// How often the timeout sweeper looks for expired deadlines.
    pub sweep_interval: Duration,

    /// Events between two snapshots of an instance. 0 disables snapshots.
    pub snapshot_interval: usize,

    /// Number of timeout registry shards.
    pub timeout_shards: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            snapshot_interval: 50,
            timeout_shards: 16,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval.max(crate::timeouts::MIN_SWEEP_INTERVAL);
        self
    }

    pub fn with_snapshot_interval(mut self, snapshot_interval: usize) -> Self {
        self.snapshot_interval = snapshot_interval;
        self
    }

    pub fn with_timeout_shards(mut self, timeout_shards: usize) -> Self {
        self.timeout_shards = timeout_shards.max(1);
        self
    }
}
