//! Queryable projections of saga instances.
//!
//! The event ledger is the source of truth; rows here are derived from it
//! after every append and may lag behind it after a crash.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::InstanceId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::aggregate::SagaInstance;
use crate::error::Result;
use crate::record::{StepExecutionRecord, TimeoutEntry};
use crate::state::SagaStatus;

/// The `saga_instances` row of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRow {
    pub instance_id: InstanceId,
    pub definition_name: String,
    pub correlation_id: String,
    pub initiator: String,
    pub status: SagaStatus,
    pub current_step: usize,
    pub last_sequence: i64,
    /// Set when a second writer was detected; recovery skips frozen rows.
    pub frozen: bool,
    pub frozen_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRow {
    /// Projects an instance. Returns `None` for an instance with no events.
    pub fn from_instance(instance: &SagaInstance) -> Option<Self> {
        let instance_id = instance.id()?;
        let created_at = instance.created_at().unwrap_or_else(Utc::now);
        Some(Self {
            instance_id,
            definition_name: instance.definition_name().to_string(),
            correlation_id: instance.correlation_id().to_string(),
            initiator: instance.initiator().to_string(),
            status: instance.status(),
            current_step: instance.current_step(),
            last_sequence: instance.sequence().as_i64(),
            frozen: false,
            frozen_reason: None,
            created_at,
            updated_at: instance.updated_at().unwrap_or(created_at),
        })
    }
}

/// Storage for instance rows, execution records and armed timeouts.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Inserts or updates an instance row. The frozen flag is preserved.
    async fn save_instance(&self, row: &InstanceRow) -> Result<()>;

    async fn get_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRow>>;

    /// Marks an instance as needing manual intervention.
    async fn flag_frozen(&self, instance_id: InstanceId, reason: &str) -> Result<()>;

    async fn record_execution(&self, record: &StepExecutionRecord) -> Result<()>;

    /// Execution records of an instance in insertion order.
    async fn executions(&self, instance_id: InstanceId) -> Result<Vec<StepExecutionRecord>>;

    async fn save_timeout(&self, entry: &TimeoutEntry) -> Result<()>;

    async fn delete_timeout(&self, instance_id: InstanceId, step_index: usize) -> Result<()>;

    async fn timeouts_for(&self, instance_id: InstanceId) -> Result<Vec<TimeoutEntry>>;
}

#[derive(Default)]
struct Tables {
    instances: HashMap<InstanceId, InstanceRow>,
    executions: HashMap<InstanceId, Vec<StepExecutionRecord>>,
    timeouts: HashMap<(InstanceId, usize), TimeoutEntry>,
}

/// In-memory saga repository for tests and single-process runs.
#[derive(Clone, Default)]
pub struct InMemorySagaRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemorySagaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.tables.read().await.instances.len()
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn save_instance(&self, row: &InstanceRow) -> Result<()> {
        let mut tables = self.tables.write().await;
        let mut row = row.clone();
        if let Some(existing) = tables.instances.get(&row.instance_id) {
            // Rows never move backwards.
            if existing.last_sequence > row.last_sequence {
                return Ok(());
            }
            row.created_at = existing.created_at;
            row.frozen = existing.frozen;
            row.frozen_reason = existing.frozen_reason.clone();
        }
        tables.instances.insert(row.instance_id, row);
        Ok(())
    }

    async fn get_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRow>> {
        Ok(self.tables.read().await.instances.get(&instance_id).cloned())
    }

    async fn flag_frozen(&self, instance_id: InstanceId, reason: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.instances.get_mut(&instance_id) {
            row.frozen = true;
            row.frozen_reason = Some(reason.to_string());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_execution(&self, record: &StepExecutionRecord) -> Result<()> {
        self.tables
            .write()
            .await
            .executions
            .entry(record.instance_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn executions(&self, instance_id: InstanceId) -> Result<Vec<StepExecutionRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .executions
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_timeout(&self, entry: &TimeoutEntry) -> Result<()> {
        self.tables
            .write()
            .await
            .timeouts
            .insert((entry.instance_id, entry.step_index), *entry);
        Ok(())
    }

    async fn delete_timeout(&self, instance_id: InstanceId, step_index: usize) -> Result<()> {
        self.tables
            .write()
            .await
            .timeouts
            .remove(&(instance_id, step_index));
        Ok(())
    }

    async fn timeouts_for(&self, instance_id: InstanceId) -> Result<Vec<TimeoutEntry>> {
        let tables = self.tables.read().await;
        let mut entries: Vec<_> = tables
            .timeouts
            .values()
            .filter(|entry| entry.instance_id == instance_id)
            .copied()
            .collect();
        entries.sort_by_key(|entry| entry.step_index);
        Ok(entries)
    }
}
