use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use quoteflow_core::{AggregateId, CompanyId, ExpectedVersion};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Lifecycle:
///
/// 1. **Domain event**: created by an aggregate's `handle()`
/// 2. **UncommittedEvent**: wrapped with stream metadata (company, aggregate, type)
/// 3. **StoredEvent**: persisted with an assigned `sequence_number`
/// 4. **EventEnvelope**: published to the event bus
///
/// Build it with [`UncommittedEvent::from_typed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub company_id: CompanyId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are stream-scoped (`company_id + aggregate_id`), start at 1
/// and have no gaps. The last sequence number of a stream is its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub company_id: CompanyId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into a company-scoped envelope for publication.
    pub fn to_envelope(&self) -> quoteflow_events::EventEnvelope<JsonValue> {
        quoteflow_events::EventEnvelope::new(
            self.event_id,
            self.company_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.event_type.clone(),
            self.sequence_number,
            self.payload.clone(),
        )
    }
}

/// One stream's share of a multi-stream append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub events: Vec<UncommittedEvent>,
    pub expected_version: ExpectedVersion,
}

impl StreamAppend {
    pub fn new(events: Vec<UncommittedEvent>, expected_version: ExpectedVersion) -> Self {
        Self {
            events,
            expected_version,
        }
    }
}

/// Event store operation error.
///
/// Infrastructure errors (storage, concurrency, isolation), as opposed to
/// domain errors (validation, preconditions, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("company isolation violation: {0}")]
    CompanyIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only, company-scoped event store.
///
/// Streams are keyed by `(company_id, aggregate_id)`. Within a stream events
/// have sequence numbers `1, 2, 3, ...`.
///
/// `append_batch()` is the unit-of-work primitive: it checks every stream's
/// expected version and writes all streams, or writes nothing. A single-stream
/// `append()` is a batch of one.
///
/// Implementations must:
/// - reject batches whose events mix companies or aggregate types within a stream
/// - enforce optimistic concurrency per stream
/// - assign sequence numbers monotonically (no gaps, no duplicates)
/// - persist the whole batch atomically
pub trait EventStore: Send + Sync {
    /// Atomically append to several streams, each with its own version check.
    ///
    /// Returns the committed events in batch order.
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Append events to a single aggregate stream.
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_batch(vec![StreamAppend::new(events, expected_version)])
    }

    /// Load the full stream for a company + aggregate, in sequence order.
    ///
    /// An unknown stream loads as empty.
    fn load_stream(
        &self,
        company_id: CompanyId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load every event of one aggregate type for a company, in commit order.
    ///
    /// Used to rebuild read models.
    fn load_by_type(
        &self,
        company_id: CompanyId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_batch(batch)
    }

    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        company_id: CompanyId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(company_id, aggregate_id)
    }

    fn load_by_type(
        &self,
        company_id: CompanyId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_by_type(company_id, aggregate_type)
    }
}

/// Checks that a stream's events share one company, aggregate and type.
///
/// Returns `(company_id, aggregate_id, aggregate_type)` of the stream, or
/// `None` for an empty event list.
pub(crate) fn validate_stream(
    events: &[UncommittedEvent],
) -> Result<Option<(CompanyId, AggregateId, String)>, EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(None);
    };

    for (idx, e) in events.iter().enumerate() {
        if e.company_id != first.company_id {
            return Err(EventStoreError::CompanyIsolation(format!(
                "stream batch contains multiple company_ids (index {idx})"
            )));
        }
        if e.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream batch contains multiple aggregate_ids (index {idx})"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }

    Ok(Some((
        first.company_id,
        first.aggregate_id,
        first.aggregate_type.clone(),
    )))
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    ///
    /// Serializes the event to JSON and captures the metadata needed to
    /// deserialize it later.
    pub fn from_typed<E>(
        company_id: CompanyId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: quoteflow_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            company_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
