use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EventEnvelope, EventId, EventStoreError, InstanceId, Result, SequenceNumber, Snapshot,
    store::{AppendOptions, EventStore, EventStream, validate_batch},
};

macro_rules! select_events {
    ($tail:literal) => {
        concat!(
            "SELECT event_id, instance_id, sequence_number, event_type, timestamp, payload, metadata \
             FROM event_store ",
            $tail
        )
    };
}

const LOAD_EVENTS_FROM: &str = select_events!(
    "WHERE instance_id = $1 AND sequence_number >= $2 ORDER BY sequence_number ASC"
);

const STREAM_ALL_EVENTS: &str = select_events!("ORDER BY global_position ASC");

/// PostgreSQL-backed event store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            sequence: SequenceNumber::new(row.try_get("sequence_number")?),
            event_type: row.try_get("event_type")?,
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events), fields(count = events.len()))]
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceNumber> {
        validate_batch(&events)?;
        let start = Instant::now();
        let instance_id = events[0].instance_id;

        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_sequence {
            let current: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(sequence_number) FROM event_store WHERE instance_id = $1",
            )
            .bind(instance_id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;

            let actual = SequenceNumber::new(current.unwrap_or(0));
            if actual != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    instance_id,
                    expected,
                    actual,
                });
            }
        }

        let mut last = SequenceNumber::initial();
        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO event_store (event_id, instance_id, sequence_number, event_type, timestamp, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(instance_id.as_uuid())
            .bind(event.sequence.as_i64())
            .bind(&event.event_type)
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A concurrent writer got this sequence number first
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_instance_sequence")
                {
                    return EventStoreError::ConcurrencyConflict {
                        instance_id,
                        expected: options
                            .expected_sequence
                            .unwrap_or(SequenceNumber::new(event.sequence.as_i64() - 1)),
                        actual: event.sequence,
                    };
                }
                EventStoreError::Database(e)
            })?;

            last = event.sequence;
        }

        tx.commit().await?;
        metrics::histogram!("event_store_append_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        Ok(last)
    }

    async fn load_events(&self, instance_id: InstanceId) -> Result<Vec<EventEnvelope>> {
        self.load_events_from(instance_id, SequenceNumber::initial())
            .await
    }

    async fn load_events_from(
        &self,
        instance_id: InstanceId,
        from: SequenceNumber,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(LOAD_EVENTS_FROM)
        .bind(instance_id.as_uuid())
        .bind(from.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn last_sequence(&self, instance_id: InstanceId) -> Result<Option<SequenceNumber>> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM event_store WHERE instance_id = $1",
        )
        .bind(instance_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(sequence.map(SequenceNumber::new))
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(STREAM_ALL_EVENTS)
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_event(row),
            Err(e) => Err(EventStoreError::Database(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_snapshots (instance_id, sequence_number, timestamp, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (instance_id) DO UPDATE SET
                sequence_number = EXCLUDED.sequence_number,
                timestamp = EXCLUDED.timestamp,
                state = EXCLUDED.state
            "#,
        )
        .bind(snapshot.instance_id.as_uuid())
        .bind(snapshot.sequence.as_i64())
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_snapshot(&self, instance_id: InstanceId) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT instance_id, sequence_number, timestamp, state
            FROM saga_snapshots
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
                sequence: SequenceNumber::new(row.try_get("sequence_number")?),
                timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
                state: row.try_get("state")?,
            })),
            None => Ok(None),
        }
    }
}
