//! Postgres-backed event repository.
//!
//! Events live in one append-only table (`domain_events`, see
//! `migrations/0001_domain_events.sql`). Version continuity is enforced twice:
//! the insert transaction checks `MAX(version) + 1`, and the unique constraint
//! on `(aggregate_id, aggregate_type, version)` catches a concurrent writer
//! that slipped in between.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `VersionConflict` (insert) / `Persistence` |
//! | Database (check violation) | `23514` | `InvalidEvent` |
//! | Database (other) | Any other | `Persistence` |
//! | PoolClosed | N/A | `Closed` |
//! | Other | N/A | `Persistence` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use chronicle_core::{EventId, StreamKey, StreamVersion};
use chronicle_events::{DomainEvent, EventMetadata};

use super::query::Pagination;
use super::r#trait::{EventRepository, EventStoreError};

const MIGRATION: &str = include_str!("../../migrations/0001_domain_events.sql");

const SELECT_COLUMNS: &str =
    "id, aggregate_id, aggregate_type, type, version, data, metadata, timestamp";

/// Postgres-backed append-only event repository.
///
/// `Clone` is cheap: the pool is reference counted internally.
#[derive(Debug, Clone)]
pub struct PostgresEventRepository {
    pool: PgPool,
}

impl PostgresEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table, indexes and immutability trigger (idempotent).
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<DomainEvent>, EventStoreError> {
        rows.iter()
            .map(|row| {
                EventRow::from_row(row)
                    .map_err(|e| {
                        EventStoreError::Serialization(format!("failed to read event row: {e}"))
                    })
                    .and_then(DomainEvent::try_from)
            })
            .collect()
    }
}

#[async_trait]
impl EventRepository for PostgresEventRepository {
    #[instrument(
        skip(self, event),
        fields(
            event_id = %event.id,
            aggregate_type = %event.aggregate_type,
            aggregate_id = %event.aggregate_id,
            version = event.version
        ),
        err
    )]
    async fn insert(&self, event: &DomainEvent) -> Result<(), EventStoreError> {
        let stream = event.stream_key();
        let metadata = serde_json::to_value(&event.metadata)
            .map_err(|e| EventStoreError::Serialization(format!("metadata: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current = current_version(&mut tx, &stream).await?;
        if let Err(e) = StreamVersion::new(current).check_next(event.version) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::from_domain(&stream, e));
        }

        sqlx::query(
            r#"
            INSERT INTO domain_events (
                id, aggregate_id, aggregate_type, type, version, data, metadata, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(event.version as i64)
        .bind(&event.data)
        .bind(&metadata)
        .bind(event.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::version_conflict(&stream, current + 1, event.version)
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream = %stream, event_count = tracing::field::Empty), err)]
    async fn load_stream(&self, stream: &StreamKey) -> Result<Vec<DomainEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events \
             WHERE aggregate_id = $1 AND aggregate_type = $2 \
             ORDER BY version ASC"
        ))
        .bind(&stream.aggregate_id)
        .bind(&stream.aggregate_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let events = Self::decode_rows(rows)?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    #[instrument(skip(self), err)]
    async fn load_by_type(
        &self,
        event_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events \
             WHERE type = $1 \
             ORDER BY timestamp ASC, id ASC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(event_type)
        .bind(i64::from(page.limit))
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_type", e))?;

        Self::decode_rows(rows)
    }

    #[instrument(skip(self), err)]
    async fn load_by_aggregate_type(
        &self,
        aggregate_type: &str,
        page: Pagination,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events \
             WHERE aggregate_type = $1 \
             ORDER BY aggregate_id ASC, version ASC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(aggregate_type)
        .bind(i64::from(page.limit))
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_aggregate_type", e))?;

        Self::decode_rows(rows)
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<DomainEvent>, EventStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM domain_events WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_event", e))?;

        row.map(|row| Self::decode_rows(vec![row]))
            .transpose()
            .map(|events| events.and_then(|mut v| v.pop()))
    }

    #[instrument(skip(self), fields(stream = %stream), err)]
    async fn stream_version(&self, stream: &StreamKey) -> Result<u64, EventStoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS current_version FROM domain_events \
             WHERE aggregate_id = $1 AND aggregate_type = $2",
        )
        .bind(&stream.aggregate_id)
        .bind(&stream.aggregate_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_version", e))?;

        read_version(&row)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

async fn current_version(
    tx: &mut Transaction<'_, Postgres>,
    stream: &StreamKey,
) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(version), 0) AS current_version FROM domain_events \
         WHERE aggregate_id = $1 AND aggregate_type = $2",
    )
    .bind(&stream.aggregate_id)
    .bind(&stream.aggregate_type)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("current_version", e))?;

    read_version(&row)
}

fn read_version(row: &PgRow) -> Result<u64, EventStoreError> {
    let version: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Serialization(format!("failed to read current_version: {e}")))?;
    Ok(version.max(0) as u64)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidEvent(msg),
                _ => EventStoreError::Persistence(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Closed,
        other => EventStoreError::Persistence(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[derive(Debug)]
struct EventRow {
    id: uuid::Uuid,
    aggregate_id: String,
    aggregate_type: String,
    event_type: String,
    version: i64,
    data: JsonValue,
    metadata: JsonValue,
    timestamp: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("type")?,
            version: row.try_get("version")?,
            data: row.try_get("data")?,
            metadata: row.try_get("metadata")?,
            timestamp: row.try_get("timestamp")?,
        })
    }
}

impl TryFrom<EventRow> for DomainEvent {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let metadata: EventMetadata = serde_json::from_value(row.metadata).map_err(|e| {
            EventStoreError::Serialization(format!("metadata of event {}: {e}", row.id))
        })?;

        Ok(DomainEvent {
            id: EventId::from_uuid(row.id),
            event_type: row.event_type,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            version: row.version.max(0) as u64,
            data: row.data,
            metadata,
            timestamp: row.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_converts_to_event() {
        let id = uuid::Uuid::now_v7();
        let now = Utc::now();
        let row = EventRow {
            id,
            aggregate_id: "P1".to_string(),
            aggregate_type: "patient".to_string(),
            event_type: "patient.created".to_string(),
            version: 1,
            data: json!({"name": "Ada"}),
            metadata: json!({"correlationId": "c-1", "source": "admissions"}),
            timestamp: now,
        };

        let event = DomainEvent::try_from(row).unwrap();
        assert_eq!(event.id, EventId::from_uuid(id));
        assert_eq!(event.version, 1);
        assert_eq!(event.correlation_id(), "c-1");
        assert_eq!(event.metadata.extra["source"], json!("admissions"));
    }

    #[test]
    fn row_with_bad_metadata_is_a_serialization_error() {
        let row = EventRow {
            id: uuid::Uuid::now_v7(),
            aggregate_id: "P1".to_string(),
            aggregate_type: "patient".to_string(),
            event_type: "patient.created".to_string(),
            version: 1,
            data: json!({}),
            metadata: json!("not an object"),
            timestamp: Utc::now(),
        };

        assert!(matches!(
            DomainEvent::try_from(row),
            Err(EventStoreError::Serialization(_))
        ));
    }

    #[test]
    fn pool_closed_maps_to_closed() {
        assert!(matches!(
            map_sqlx_error("load_stream", sqlx::Error::PoolClosed),
            EventStoreError::Closed
        ));
    }
}
