use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use quoteflow_core::{AggregateId, CompanyId};

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, StreamAppend, validate_stream,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    company_id: CompanyId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<StreamKey, Vec<StoredEvent>>,
    /// Every committed event in commit order.
    log: Vec<StoredEvent>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. A batch is checked and written under one write lock,
/// which makes multi-stream appends atomic.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append_batch(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        // Phase 1: validate everything before touching any stream.
        let mut planned = Vec::with_capacity(batch.len());
        let mut touched = HashSet::new();
        for append in batch {
            let Some((company_id, aggregate_id, aggregate_type)) = validate_stream(&append.events)?
            else {
                continue;
            };

            let key = StreamKey {
                company_id,
                aggregate_id,
            };
            if !touched.insert(key) {
                return Err(EventStoreError::InvalidAppend(format!(
                    "stream {aggregate_id} appears twice in one batch"
                )));
            }

            let stream = inner.streams.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            let current = Self::current_version(stream);
            if !append.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {aggregate_id}: expected {:?}, found {current}",
                    append.expected_version
                )));
            }
            if let Some(existing) = stream.first() {
                if existing.aggregate_type != aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', attempted append with '{}'",
                        existing.aggregate_type, aggregate_type
                    )));
                }
            }

            planned.push((key, current, append.events));
        }

        // Phase 2: assign sequence numbers and append.
        let mut committed = Vec::new();
        for (key, current, events) in planned {
            let mut next = current + 1;
            for e in events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    company_id: e.company_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                inner.streams.entry(key).or_default().push(stored.clone());
                inner.log.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(
        &self,
        company_id: CompanyId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            company_id,
            aggregate_id,
        };

        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(inner.streams.get(&key).cloned().unwrap_or_default())
    }

    fn load_by_type(
        &self,
        company_id: CompanyId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(inner
            .log
            .iter()
            .filter(|e| e.company_id == company_id && e.aggregate_type == aggregate_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::UncommittedEvent;
    use chrono::Utc;
    use quoteflow_core::ExpectedVersion;
    use uuid::Uuid;

    fn event(
        company_id: CompanyId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
    ) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            company_id,
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: format!("{aggregate_type}.touched"),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn batch_assigns_per_stream_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let company_id = CompanyId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        store
            .append(vec![event(company_id, a, "sales.order")], ExpectedVersion::Exact(0))
            .unwrap();

        let committed = store
            .append_batch(vec![
                StreamAppend::new(
                    vec![event(company_id, a, "sales.order"), event(company_id, a, "sales.order")],
                    ExpectedVersion::Exact(1),
                ),
                StreamAppend::new(
                    vec![event(company_id, b, "quotation.request")],
                    ExpectedVersion::Exact(0),
                ),
            ])
            .unwrap();

        let seqs: Vec<u64> = committed.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3, 1]);
        assert_eq!(store.load_stream(company_id, a).unwrap().len(), 3);
        assert_eq!(store.load_by_type(company_id, "quotation.request").unwrap().len(), 1);
    }

    #[test]
    fn one_stale_stream_rejects_the_whole_batch() {
        let store = InMemoryEventStore::new();
        let company_id = CompanyId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        store
            .append(vec![event(company_id, b, "sales.order")], ExpectedVersion::Exact(0))
            .unwrap();

        let err = store
            .append_batch(vec![
                StreamAppend::new(
                    vec![event(company_id, a, "quotation.request")],
                    ExpectedVersion::Exact(0),
                ),
                StreamAppend::new(
                    vec![event(company_id, b, "sales.order")],
                    ExpectedVersion::Exact(0),
                ),
            ])
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert!(store.load_stream(company_id, a).unwrap().is_empty());
        assert_eq!(store.load_stream(company_id, b).unwrap().len(), 1);
    }

    #[test]
    fn streams_are_isolated_per_company() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let company_id = CompanyId::new();

        store
            .append(vec![event(company_id, a, "sales.order")], ExpectedVersion::Any)
            .unwrap();

        assert!(store.load_stream(CompanyId::new(), a).unwrap().is_empty());
        let err = store
            .append(
                vec![
                    event(company_id, a, "sales.order"),
                    event(CompanyId::new(), a, "sales.order"),
                ],
                ExpectedVersion::Any,
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::CompanyIsolation(_)));
    }

    #[test]
    fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let company_id = CompanyId::new();
        let a = AggregateId::new();

        store
            .append(vec![event(company_id, a, "sales.order")], ExpectedVersion::Any)
            .unwrap();
        let err = store
            .append(vec![event(company_id, a, "purchasing.order")], ExpectedVersion::Any)
            .unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }
}
