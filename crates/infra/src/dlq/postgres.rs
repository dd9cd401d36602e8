//! Postgres-backed [`DlqStorage`].
//!
//! The storage trait is synchronous and is called from pool worker threads,
//! which have no async runtime of their own. Queries are driven through a
//! captured `tokio::runtime::Handle`, so the handle must belong to a runtime
//! that outlives the dead-letter queue (a multi-thread runtime owned by the
//! binary, for example).
//!
//! Schema: `migrations/0001_failed_events.sql`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};
use uuid::Uuid;

use courier_core::FailedEventId;

use super::storage::{DlqStorage, DlqStorageError};
use super::types::FailedEvent;

const SCHEMA: &str = include_str!("../../migrations/0001_failed_events.sql");

const SELECT_COLUMNS: &str = "id, event_type, event_data, error, failed_at, attempts, \
     max_attempts, broker_topic, broker_partition, broker_offset, metadata";

#[derive(Debug, Clone)]
pub struct PostgresDlqStorage {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresDlqStorage {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Connect a small pool on `runtime` and make sure the table exists.
    pub fn connect(database_url: &str, runtime: Handle) -> Result<Self, DlqStorageError> {
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(5)
                    .connect(database_url),
            )
            .map_err(backend)?;

        let storage = Self::new(pool, runtime);
        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Apply the bundled schema. Idempotent.
    pub fn ensure_schema(&self) -> Result<(), DlqStorageError> {
        self.runtime
            .block_on(sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .map_err(backend)?;
        debug!("failed_events schema ensured");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert(&self, row: FailedEventRow) -> Result<(), DlqStorageError> {
        sqlx::query(
            r#"
            INSERT INTO failed_events (
                id, event_type, event_data, error, failed_at, attempts, max_attempts,
                broker_topic, broker_partition, broker_offset, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                error = EXCLUDED.error,
                failed_at = EXCLUDED.failed_at,
                attempts = EXCLUDED.attempts,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(row.id)
        .bind(&row.event_type)
        .bind(&row.event_data)
        .bind(&row.error)
        .bind(row.failed_at)
        .bind(row.attempts)
        .bind(row.max_attempts)
        .bind(&row.broker_topic)
        .bind(row.broker_partition)
        .bind(row.broker_offset)
        .bind(&row.metadata)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<FailedEventRow>, DlqStorageError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM failed_events WHERE id = $1");
        sqlx::query_as::<_, FailedEventRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)
    }

    async fn page(&self, limit: i64, offset: i64) -> Result<Vec<FailedEventRow>, DlqStorageError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM failed_events ORDER BY created_at, id LIMIT $1 OFFSET $2"
        );
        sqlx::query_as::<_, FailedEventRow>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
    }
}

impl DlqStorage for PostgresDlqStorage {
    #[instrument(skip(self, event), fields(id = %event.id), err)]
    fn store(&self, event: &FailedEvent) -> Result<(), DlqStorageError> {
        let row = FailedEventRow::try_from(event)?;
        self.runtime.block_on(self.upsert(row))
    }

    fn get(&self, id: FailedEventId) -> Result<Option<FailedEvent>, DlqStorageError> {
        self.runtime
            .block_on(self.fetch(*id.as_uuid()))?
            .map(FailedEvent::try_from)
            .transpose()
    }

    fn list(&self, limit: usize, offset: usize) -> Result<Vec<FailedEvent>, DlqStorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.runtime
            .block_on(self.page(limit, offset))?
            .into_iter()
            .map(FailedEvent::try_from)
            .collect()
    }

    #[instrument(skip(self), err)]
    fn delete(&self, id: FailedEventId) -> Result<bool, DlqStorageError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query("DELETE FROM failed_events WHERE id = $1")
                    .bind(*id.as_uuid())
                    .execute(&self.pool),
            )
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    fn count(&self) -> Result<usize, DlqStorageError> {
        let query = sqlx::query_scalar("SELECT COUNT(*) FROM failed_events");
        let count: i64 = self
            .runtime
            .block_on(query.fetch_one(&self.pool))
            .map_err(backend)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn backend(e: sqlx::Error) -> DlqStorageError {
    DlqStorageError::Backend(e.to_string())
}

/// Column-level representation of a [`FailedEvent`].
#[derive(Debug, Clone, PartialEq)]
struct FailedEventRow {
    id: Uuid,
    event_type: String,
    event_data: JsonValue,
    error: String,
    failed_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    broker_topic: Option<String>,
    broker_partition: Option<i32>,
    broker_offset: Option<i64>,
    metadata: JsonValue,
}

impl<'r> sqlx::FromRow<'r, PgRow> for FailedEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            error: row.try_get("error")?,
            failed_at: row.try_get("failed_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            broker_topic: row.try_get("broker_topic")?,
            broker_partition: row.try_get("broker_partition")?,
            broker_offset: row.try_get("broker_offset")?,
            metadata: row.try_get("metadata")?,
        })
    }
}

impl TryFrom<&FailedEvent> for FailedEventRow {
    type Error = DlqStorageError;

    fn try_from(event: &FailedEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: *event.id.as_uuid(),
            event_type: event.event_type.clone(),
            event_data: JsonValue::Object(event.event_data.clone()),
            error: event.error.clone(),
            failed_at: event.timestamp,
            attempts: i32::try_from(event.attempts).unwrap_or(i32::MAX),
            max_attempts: i32::try_from(event.max_attempts).unwrap_or(i32::MAX),
            broker_topic: event.topic.clone(),
            broker_partition: event.partition,
            broker_offset: event.offset,
            metadata: serde_json::to_value(&event.metadata)?,
        })
    }
}

impl TryFrom<FailedEventRow> for FailedEvent {
    type Error = DlqStorageError;

    fn try_from(row: FailedEventRow) -> Result<Self, Self::Error> {
        let event_data = match row.event_data {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                return Err(DlqStorageError::Backend(format!(
                    "failed event {} has non-object event_data: {other}",
                    row.id
                )));
            }
        };
        let metadata: HashMap<String, String> = serde_json::from_value(row.metadata)?;

        Ok(Self {
            id: FailedEventId::from_uuid(row.id),
            event_type: row.event_type,
            event_data,
            error: row.error,
            timestamp: row.failed_at,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(0),
            topic: row.broker_topic,
            partition: row.broker_partition,
            offset: row.broker_offset,
            metadata,
        })
    }
}
