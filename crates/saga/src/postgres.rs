use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::InstanceId;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::error::{Result, SagaError};
use crate::record::{StepExecutionRecord, TimeoutEntry};
use crate::repository::{InstanceRow, SagaRepository};

/// PostgreSQL-backed saga repository.
///
/// Shares the pool and migrations of the event store.
#[derive(Clone)]
pub struct PostgresSagaRepository {
    pool: PgPool,
}

impl PostgresSagaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_instance(row: PgRow) -> Result<InstanceRow> {
        let status: String = row.try_get("status")?;
        let current_step: i32 = row.try_get("current_step")?;
        Ok(InstanceRow {
            instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            definition_name: row.try_get("definition_name")?,
            correlation_id: row.try_get("correlation_id")?,
            initiator: row.try_get("initiator")?,
            status: status.parse()?,
            current_step: current_step as usize,
            last_sequence: row.try_get("last_sequence")?,
            frozen: row.try_get("frozen")?,
            frozen_reason: row.try_get("frozen_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_execution(row: PgRow) -> Result<StepExecutionRecord> {
        let direction: String = row.try_get("direction")?;
        let status: String = row.try_get("status")?;
        let step_index: i32 = row.try_get("step_index")?;
        let attempt: i32 = row.try_get("attempt")?;
        Ok(StepExecutionRecord {
            instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            step_index: step_index as usize,
            step_name: row.try_get("step_name")?,
            direction: direction.parse()?,
            attempt: attempt as u32,
            status: status.parse()?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
            result: row.try_get("result")?,
        })
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaRepository {
    async fn save_instance(&self, row: &InstanceRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_instances
                (instance_id, definition_name, correlation_id, initiator, status,
                 current_step, last_sequence, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (instance_id) DO UPDATE SET
                status = EXCLUDED.status,
                current_step = EXCLUDED.current_step,
                last_sequence = EXCLUDED.last_sequence,
                updated_at = EXCLUDED.updated_at
            WHERE saga_instances.last_sequence <= EXCLUDED.last_sequence
            "#,
        )
        .bind(row.instance_id.as_uuid())
        .bind(&row.definition_name)
        .bind(&row.correlation_id)
        .bind(&row.initiator)
        .bind(row.status.as_str())
        .bind(row.current_step as i32)
        .bind(row.last_sequence)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRow>> {
        let row = sqlx::query(
            r#"
            SELECT instance_id, definition_name, correlation_id, initiator, status,
                   current_step, last_sequence, frozen, frozen_reason, created_at, updated_at
            FROM saga_instances
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_instance).transpose()
    }

    async fn flag_frozen(&self, instance_id: InstanceId, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE saga_instances SET frozen = TRUE, frozen_reason = $2, updated_at = NOW() WHERE instance_id = $1",
        )
        .bind(instance_id.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_execution(&self, record: &StepExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_step_executions
                (instance_id, step_index, step_name, direction, attempt, status,
                 started_at, completed_at, error, result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.instance_id.as_uuid())
        .bind(record.step_index as i32)
        .bind(&record.step_name)
        .bind(record.direction.as_str())
        .bind(record.attempt as i32)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.error)
        .bind(&record.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn executions(&self, instance_id: InstanceId) -> Result<Vec<StepExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, step_index, step_name, direction, attempt, status,
                   started_at, completed_at, error, result
            FROM saga_step_executions
            WHERE instance_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(instance_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_execution).collect()
    }

    async fn save_timeout(&self, entry: &TimeoutEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_timeouts (instance_id, step_index, deadline)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id, step_index) DO UPDATE SET deadline = EXCLUDED.deadline
            "#,
        )
        .bind(entry.instance_id.as_uuid())
        .bind(entry.step_index as i32)
        .bind(entry.deadline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_timeout(&self, instance_id: InstanceId, step_index: usize) -> Result<()> {
        sqlx::query("DELETE FROM saga_timeouts WHERE instance_id = $1 AND step_index = $2")
            .bind(instance_id.as_uuid())
            .bind(step_index as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn timeouts_for(&self, instance_id: InstanceId) -> Result<Vec<TimeoutEntry>> {
        let rows = sqlx::query(
            "SELECT step_index, deadline FROM saga_timeouts WHERE instance_id = $1 ORDER BY step_index",
        )
        .bind(instance_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let step_index: i32 = row.try_get("step_index")?;
                let deadline: DateTime<Utc> = row.try_get("deadline")?;
                Ok(TimeoutEntry {
                    instance_id,
                    step_index: step_index as usize,
                    deadline,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(SagaError::from)
    }
}
