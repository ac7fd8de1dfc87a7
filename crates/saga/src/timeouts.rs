//! Step deadlines.
//!
//! Deadlines are kept in shards keyed by instance id so arming and
//! disarming for unrelated instances rarely contend. The sweeper pops every
//! expired entry and signals the owning driver.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::InstanceId;
use tracing::{debug, info};

use crate::record::TimeoutEntry;
use crate::registry::{InstanceRegistry, Signal};

type Key = (InstanceId, usize);

#[derive(Default)]
struct Shard {
    by_deadline: BTreeSet<(DateTime<Utc>, InstanceId, usize)>,
    by_key: HashMap<Key, DateTime<Utc>>,
}

impl Shard {
    fn remove(&mut self, key: &Key) -> Option<DateTime<Utc>> {
        let deadline = self.by_key.remove(key)?;
        self.by_deadline.remove(&(deadline, key.0, key.1));
        Some(deadline)
    }
}

/// Armed step deadlines.
pub struct TimeoutRegistry {
    shards: Vec<Mutex<Shard>>,
}

impl TimeoutRegistry {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::default()).collect(),
        }
    }

    fn shard(&self, instance_id: InstanceId) -> std::sync::MutexGuard<'_, Shard> {
        let index = (instance_id.as_uuid().as_u128() % self.shards.len() as u128) as usize;
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms a deadline, replacing any previous one for the same step.
    pub fn arm(&self, entry: TimeoutEntry) {
        let key = (entry.instance_id, entry.step_index);
        let mut shard = self.shard(entry.instance_id);
        shard.remove(&key);
        shard
            .by_deadline
            .insert((entry.deadline, entry.instance_id, entry.step_index));
        shard.by_key.insert(key, entry.deadline);
    }

    /// Returns true if a deadline was armed.
    pub fn disarm(&self, instance_id: InstanceId, step_index: usize) -> bool {
        self.shard(instance_id)
            .remove(&(instance_id, step_index))
            .is_some()
    }

    pub fn deadline(&self, instance_id: InstanceId, step_index: usize) -> Option<DateTime<Utc>> {
        self.shard(instance_id)
            .by_key
            .get(&(instance_id, step_index))
            .copied()
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<TimeoutEntry> {
        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            while let Some(&(deadline, instance_id, step_index)) = shard.by_deadline.first() {
                if deadline > now {
                    break;
                }
                shard.remove(&(instance_id, step_index));
                expired.push(TimeoutEntry {
                    instance_id,
                    step_index,
                    deadline,
                });
            }
        }
        expired.sort_by_key(|entry| entry.deadline);
        expired
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).by_key.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically fires expired deadlines.
pub struct TimeoutSweeper {
    timeouts: Arc<TimeoutRegistry>,
    instances: Arc<InstanceRegistry>,
    interval: Duration,
}

/// Shortest sweep period; `tokio::time::interval` rejects zero.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

impl TimeoutSweeper {
    pub fn new(
        timeouts: Arc<TimeoutRegistry>,
        instances: Arc<InstanceRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            timeouts,
            instances,
            interval: interval.max(MIN_SWEEP_INTERVAL),
        }
    }

    /// Signals the driver of every expired step. Returns how many were
    /// delivered.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let mut delivered = 0;
        for entry in self.timeouts.take_expired(now) {
            metrics::counter!("saga_step_timeouts_total").increment(1);
            let signal = Signal::TimedOut {
                step_index: entry.step_index,
            };
            if self.instances.signal(entry.instance_id, signal) {
                delivered += 1;
                info!(
                    instance_id = %entry.instance_id,
                    step_index = entry.step_index,
                    deadline = %entry.deadline,
                    "step deadline expired"
                );
            } else {
                debug!(
                    instance_id = %entry.instance_id,
                    step_index = entry.step_index,
                    "deadline expired for an instance with no live driver"
                );
            }
        }
        delivered
    }

    /// Sweeps on every tick until the task is dropped.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once(Utc::now());
        }
    }
}
