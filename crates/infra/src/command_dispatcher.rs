//! Command execution pipeline (application-level orchestration).
//!
//! ## Single-aggregate flow
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store (company-scoped)
//!   ↓
//! 2. Rehydrate aggregate (apply historical events)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish events to bus
//! ```
//!
//! ## Unit of work
//!
//! Workflow operations touch several aggregates at once (requests, purchase
//! orders, sales orders). They load each one as a [`Tracked`] aggregate,
//! execute commands against it in memory, stage it into a [`UnitOfWork`] and
//! [`CommandDispatcher::commit`] the whole unit with one atomic multi-stream
//! append. Every stream carries the version it was loaded at, so a concurrent
//! writer on any of them fails the unit and nothing is committed.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use quoteflow_core::{Aggregate, AggregateId, CompanyId, DomainError, ExpectedVersion};
use quoteflow_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Company isolation violation (cross-company or cross-aggregate stream mixing).
    #[error("company isolation violation: {0}")]
    CompanyIsolation(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// User-actionable: a transition lacks its required fields or stage.
    #[error("precondition failed for '{reference}': {reason}")]
    Precondition { reference: String, reason: String },
    #[error("no eligible requests: {0}")]
    NoEligibleRequests(String),
    /// Bug: more than one live request/line link.
    #[error("duplicate link for '{reference}': {reason}")]
    DuplicateLink { reference: String, reason: String },
    /// Bug: a domain invariant does not hold.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("not found")]
    NotFound,
    /// Historical payloads could not be read back as the aggregate's events.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Store(EventStoreError),
    /// Publication failed after a successful append (at-least-once; retry may duplicate).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl DispatchError {
    /// True for failures that indicate a bug rather than bad input.
    pub fn is_invariant_breach(&self) -> bool {
        matches!(
            self,
            DispatchError::DuplicateLink { .. } | DispatchError::InvariantViolation(_)
        )
    }

    /// True for failures the acting user can fix (fill a field, pick other records).
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            DispatchError::Validation(_)
                | DispatchError::Precondition { .. }
                | DispatchError::NoEligibleRequests(_)
        )
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            EventStoreError::CompanyIsolation(msg) => DispatchError::CompanyIsolation(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::Precondition { reference, reason } => {
                DispatchError::Precondition { reference, reason }
            }
            DomainError::NoEligibleRequests(msg) => DispatchError::NoEligibleRequests(msg),
            DomainError::DuplicateLink { reference, reason } => {
                DispatchError::DuplicateLink { reference, reason }
            }
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// An aggregate rehydrated for a unit of work, with its not-yet-committed events.
#[derive(Debug)]
pub struct Tracked<A> {
    company_id: CompanyId,
    aggregate_id: AggregateId,
    aggregate_type: String,
    loaded_version: u64,
    aggregate: A,
    pending: Vec<UncommittedEvent>,
}

impl<A> Tracked<A>
where
    A: Aggregate<Error = DomainError>,
    A::Event: quoteflow_events::Event + Serialize,
{
    /// Current in-memory state, including pending events.
    pub fn state(&self) -> &A {
        &self.aggregate
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn loaded_version(&self) -> u64 {
        self.loaded_version
    }

    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decide and apply a command in memory. Nothing is persisted until commit.
    pub fn execute(&mut self, command: &A::Command) -> Result<Vec<A::Event>, DispatchError> {
        let decided = self.aggregate.handle(command)?;

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    self.company_id,
                    self.aggregate_id,
                    self.aggregate_type.clone(),
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        for ev in &decided {
            self.aggregate.apply(ev);
        }
        self.pending.extend(uncommitted);

        Ok(decided)
    }
}

/// Staged streams of one atomic workflow operation.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    streams: Vec<StreamAppend>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the aggregate's pending events into the unit, expecting the stream
    /// to still be at the version it was loaded at. Stage each stream once.
    pub fn stage<A>(&mut self, tracked: &mut Tracked<A>) {
        if tracked.pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut tracked.pending);
        let expected = ExpectedVersion::Exact(tracked.loaded_version);
        tracked.loaded_version += events.len() as u64;
        self.streams.push(StreamAppend::new(events, expected));
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - **Atomicity**: events are persisted before publication; a failed append
///   publishes nothing.
/// - **Consistency**: company isolation and optimistic concurrency are enforced.
/// - **At-least-once**: a publish failure after a successful append is returned
///   to the caller; the events are already durable.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate an aggregate for a unit of work.
    pub fn load<A>(
        &self,
        company_id: CompanyId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Tracked<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: quoteflow_events::Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(company_id, aggregate_id)?;
        validate_loaded_stream(company_id, aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        Ok(Tracked {
            company_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            loaded_version: stream_version(&history),
            aggregate,
            pending: Vec::new(),
        })
    }

    /// Atomically append every staged stream, then publish.
    pub fn commit(&self, unit: UnitOfWork) -> Result<Vec<StoredEvent>, DispatchError> {
        if unit.is_empty() {
            return Ok(vec![]);
        }

        let committed = self.store.append_batch(unit.streams)?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }

    /// Dispatch a single command against a single aggregate.
    ///
    /// Returns the committed events; an empty list means the command was an
    /// idempotent no-op.
    pub fn dispatch<A>(
        &self,
        company_id: CompanyId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: quoteflow_events::Event + Serialize + DeserializeOwned,
    {
        let mut tracked = self.load(company_id, aggregate_id, aggregate_type, make_aggregate)?;
        tracked.execute(&command)?;

        let mut unit = UnitOfWork::new();
        unit.stage(&mut tracked);
        self.commit(unit)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    company_id: CompanyId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // A buggy backend must not leak another company's events into a rehydration.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.company_id != company_id {
            return Err(DispatchError::CompanyIsolation(format!(
                "loaded stream contains wrong company_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::CompanyIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
