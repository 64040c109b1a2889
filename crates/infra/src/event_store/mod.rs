//! Append-only event store boundary.
//!
//! Storage-agnostic abstraction for company-scoped event streams, with an
//! in-memory implementation for tests/dev and a Postgres one for production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// Ordering invariant: **publish happens only after append succeeds**.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: quoteflow_events::EventBus<quoteflow_events::EventEnvelope<serde_json::Value>>,
{
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        // 1) Append (durable step)
        let committed = self.store.append_batch(batch)?;

        // 2) Publish committed events (at-least-once acceptable)
        for e in &committed {
            self.bus
                .publish(e.to_envelope())
                .map_err(|err| EventStoreError::Publish(format!("{err:?}")))?;
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        company_id: quoteflow_core::CompanyId,
        aggregate_id: quoteflow_core::AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(company_id, aggregate_id)
    }

    fn load_by_type(
        &self,
        company_id: quoteflow_core::CompanyId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_by_type(company_id, aggregate_type)
    }
}
