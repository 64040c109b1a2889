//! Postgres-backed event store implementation.
//!
//! Persistent store using PostgreSQL. Company isolation, optimistic concurrency
//! and append-only semantics are enforced at the database level.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent append on the same stream |
//! | Database (check constraint violation) | `23514` | `InvalidAppend` | Invalid data (e.g. sequence_number <= 0) |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / network / other | N/A | `Backend` | Connection failures |
//!
//! ## Multi-stream appends
//!
//! `append_batch_async` runs one transaction for the whole batch. Each stream's
//! version is checked inside that transaction, and the unique key on
//! `(company_id, aggregate_id, sequence_number)` catches a concurrent writer that
//! committed after the check. Either way the transaction rolls back and no
//! stream of the batch is written.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{Span, instrument};

use quoteflow_core::{AggregateId, CompanyId};

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent, validate_stream,
};

/// DDL for the events table.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    global_position  BIGSERIAL PRIMARY KEY,
    event_id         UUID NOT NULL UNIQUE,
    company_id       UUID NOT NULL,
    aggregate_id     UUID NOT NULL,
    aggregate_type   TEXT NOT NULL,
    sequence_number  BIGINT NOT NULL CHECK (sequence_number > 0),
    event_type       TEXT NOT NULL,
    event_version    INTEGER NOT NULL,
    occurred_at      TIMESTAMPTZ NOT NULL,
    payload          JSONB NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (company_id, aggregate_id, sequence_number)
);
CREATE INDEX IF NOT EXISTS events_company_type_idx
    ON events (company_id, aggregate_type, global_position);
"#;

/// Postgres-backed append-only event store.
///
/// `Send + Sync`; shares an SQLx connection pool. Every query carries
/// `company_id` in its `WHERE` clause.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the events table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Load all events for a company + aggregate stream, in sequence order.
    #[instrument(
        skip(self),
        fields(
            company_id = %company_id,
            aggregate_id = %aggregate_id,
            event_count = tracing::field::Empty
        ),
        err
    )]
    pub async fn load_stream_async(
        &self,
        company_id: CompanyId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, company_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, payload
            FROM events
            WHERE company_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(company_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let events = decode_rows(rows)?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    /// Load every event of an aggregate type for a company, in commit order.
    #[instrument(skip(self), fields(company_id = %company_id), err)]
    pub async fn load_by_type_async(
        &self,
        company_id: CompanyId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, company_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, payload
            FROM events
            WHERE company_id = $1 AND aggregate_type = $2
            ORDER BY global_position ASC
            "#,
        )
        .bind(company_id.as_uuid())
        .bind(aggregate_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_type", e))?;

        decode_rows(rows)
    }

    /// Append to several streams in one transaction.
    #[instrument(
        skip(self, batch),
        fields(stream_count = batch.len(), committed_events = tracing::field::Empty),
        err
    )]
    pub async fn append_batch_async(
        &self,
        batch: Vec<StreamAppend>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        // Validate shapes before opening a transaction.
        let mut planned = Vec::with_capacity(batch.len());
        for append in batch {
            if let Some(stream) = validate_stream(&append.events)? {
                planned.push((stream, append));
            }
        }
        if planned.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut committed = Vec::new();
        for ((company_id, aggregate_id, aggregate_type), append) in planned {
            let (current, existing_type) =
                check_stream_version(&mut tx, company_id, aggregate_id).await?;

            if let Some(existing) = existing_type {
                if existing != aggregate_type {
                    rollback(tx).await?;
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                    )));
                }
            }
            if !append.expected_version.matches(current) {
                rollback(tx).await?;
                return Err(EventStoreError::Concurrency(format!(
                    "stream {aggregate_id}: expected {:?}, found {current}",
                    append.expected_version
                )));
            }

            let mut next = current + 1;
            for event in append.events {
                insert_event(&mut tx, &event, next).await?;
                committed.push(StoredEvent {
                    event_id: event.event_id,
                    company_id: event.company_id,
                    aggregate_id: event.aggregate_id,
                    aggregate_type: event.aggregate_type,
                    sequence_number: next,
                    event_type: event.event_type,
                    event_version: event.event_version,
                    occurred_at: event.occurred_at,
                    payload: event.payload,
                });
                next += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", committed.len());
        Ok(committed)
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), EventStoreError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &UncommittedEvent,
    sequence_number: u64,
) -> Result<(), EventStoreError> {
    sqlx::query(
        r#"
        INSERT INTO events (
            event_id, company_id, aggregate_id, aggregate_type, sequence_number,
            event_type, event_version, occurred_at, payload
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(event.event_id)
    .bind(event.company_id.as_uuid())
    .bind(event.aggregate_id.as_uuid())
    .bind(&event.aggregate_type)
    .bind(sequence_number as i64)
    .bind(&event.event_type)
    .bind(event.event_version as i32)
    .bind(event.occurred_at)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            EventStoreError::Concurrency(format!(
                "concurrent append detected: stream {} already has sequence_number {sequence_number}",
                event.aggregate_id
            ))
        } else {
            map_sqlx_error("insert_event", e)
        }
    })?;
    Ok(())
}

/// Returns `(current_version, aggregate_type)`; `(0, None)` for an unknown stream.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    company_id: CompanyId,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE company_id = $1 AND aggregate_id = $2
        "#,
    )
    .bind(company_id.as_uuid())
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: Option<i64> = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Backend(format!("failed to read current_version: {e}")))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::Backend(format!("failed to read aggregate_type: {e}")))?;

    Ok((current_version.unwrap_or(0) as u64, aggregate_type))
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<StoredEvent>, EventStoreError> {
    rows.iter()
        .map(|row| {
            StoredEventRow::from_row(row)
                .map(StoredEvent::from)
                .map_err(|e| EventStoreError::Backend(format!("failed to decode event row: {e}")))
        })
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    company_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            company_id: row.try_get("company_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            company_id: CompanyId::from_uuid(row.company_id),
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}

fn runtime() -> Result<tokio::runtime::Handle, EventStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventStoreError::Backend(
            "PostgresEventStore requires a tokio runtime; call it from within a runtime context"
                .to_string(),
        )
    })
}

// The EventStore trait is synchronous. Callers run it on a blocking-capable
// thread inside a tokio runtime (e.g. `spawn_blocking`).
impl EventStore for PostgresEventStore {
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime()?.block_on(self.append_batch_async(batch))
    }

    fn load_stream(
        &self,
        company_id: CompanyId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime()?.block_on(self.load_stream_async(company_id, aggregate_id))
    }

    fn load_by_type(
        &self,
        company_id: CompanyId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime()?.block_on(self.load_by_type_async(company_id, aggregate_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pool_is_a_backend_error() {
        let err = map_sqlx_error("append", sqlx::Error::PoolClosed);
        assert!(matches!(err, EventStoreError::Backend(msg) if msg.contains("append")));
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn sync_calls_outside_a_runtime_fail_cleanly() {
        assert!(matches!(runtime(), Err(EventStoreError::Backend(_))));
    }

    #[test]
    fn rows_convert_to_stored_events() {
        let company = CompanyId::new();
        let aggregate = AggregateId::new();
        let row = StoredEventRow {
            event_id: uuid::Uuid::now_v7(),
            company_id: *company.as_uuid(),
            aggregate_id: *aggregate.as_uuid(),
            aggregate_type: "quotation.request".to_string(),
            sequence_number: 3,
            event_type: "quotation.request.created".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "reference": "RFQ/00001" }),
        };

        let stored = StoredEvent::from(row);
        assert_eq!(stored.company_id, company);
        assert_eq!(stored.aggregate_id, aggregate);
        assert_eq!(stored.sequence_number, 3);
        assert_eq!(stored.event_version, 1);
    }
}
