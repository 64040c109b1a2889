use std::collections::HashMap;
use std::sync::RwLock;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use thiserror::Error;

use quoteflow_core::{AggregateId, CompanyId, ProductId};
use quoteflow_events::EventEnvelope;
use quoteflow_purchasing::{PurchaseLineRef, PurchaseOrderId};
use quoteflow_quotation::{
    AGGREGATE_TYPE, Priority, QuotationRequestEvent, QuotationRequestId, Stage,
};
use quoteflow_sales::SalesLineRef;

use crate::read_model::CompanyStore;

/// Directory entry for one live quotation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub request_id: QuotationRequestId,
    pub reference: String,
    pub stage: Stage,
    pub priority: Priority,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub origin: Option<SalesLineRef>,
    pub purchase_line: Option<PurchaseLineRef>,
    pub final_sale_value: Option<Decimal>,
    pub completed_on: Option<NaiveDate>,
}

impl RequestSummary {
    pub fn is_open(&self) -> bool {
        self.stage.is_open()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    company_id: CompanyId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum RequestDirectoryError {
    #[error("failed to deserialize quotation request event: {0}")]
    Deserialize(String),
    #[error("company isolation violation: {0}")]
    CompanyIsolation(String),
    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Read model over quotation requests: lookups by stage, purchase order and
/// originating sales line. Withdrawn requests are dropped.
///
/// Idempotent per stream (sequence cursor), rebuildable from the event store.
#[derive(Debug)]
pub struct RequestDirectory<S>
where
    S: CompanyStore<QuotationRequestId, RequestSummary>,
{
    store: S,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S> RequestDirectory<S>
where
    S: CompanyStore<QuotationRequestId, RequestSummary>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    fn get_cursor(&self, company_id: CompanyId, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => *cursors
                .get(&CursorKey {
                    company_id,
                    aggregate_id,
                })
                .unwrap_or(&0),
            Err(_) => 0,
        }
    }

    fn update_cursor(&self, company_id: CompanyId, aggregate_id: AggregateId, seq: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(
                CursorKey {
                    company_id,
                    aggregate_id,
                },
                seq,
            );
        }
    }

    fn clear_cursors(&self, company_id: CompanyId) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.retain(|k, _| k.company_id != company_id);
        }
    }

    pub fn get(
        &self,
        company_id: CompanyId,
        request_id: &QuotationRequestId,
    ) -> Option<RequestSummary> {
        self.store.get(company_id, request_id)
    }

    pub fn list(&self, company_id: CompanyId) -> Vec<RequestSummary> {
        let mut all = self.store.list(company_id);
        all.sort_by(|a, b| a.reference.cmp(&b.reference));
        all
    }

    pub fn by_stage(&self, company_id: CompanyId, stage: Stage) -> Vec<RequestSummary> {
        self.list(company_id)
            .into_iter()
            .filter(|r| r.stage == stage)
            .collect()
    }

    /// Requests placed on any line of the given purchase order.
    pub fn by_purchase_order(
        &self,
        company_id: CompanyId,
        order_id: PurchaseOrderId,
    ) -> Vec<RequestSummary> {
        let mut linked: Vec<_> = self
            .store
            .list(company_id)
            .into_iter()
            .filter(|r| r.purchase_line.is_some_and(|l| l.order_id == order_id))
            .collect();
        linked.sort_by_key(|r| r.purchase_line.map(|l| l.line_no));
        linked
    }

    /// Open requests whose origin is the given sales line.
    pub fn open_for_line(&self, company_id: CompanyId, line: SalesLineRef) -> Vec<RequestSummary> {
        self.list(company_id)
            .into_iter()
            .filter(|r| r.origin == Some(line) && r.is_open())
            .collect()
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), RequestDirectoryError> {
        if envelope.aggregate_type() != AGGREGATE_TYPE {
            return Ok(());
        }

        let company_id = envelope.company_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let last = self.get_cursor(company_id, aggregate_id);
        if seq == 0 {
            return Err(RequestDirectoryError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(RequestDirectoryError::NonMonotonicSequence { last, found: seq });
        }

        let ev: QuotationRequestEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| RequestDirectoryError::Deserialize(e.to_string()))?;

        let (event_company, request_id) = match &ev {
            QuotationRequestEvent::RequestCreated(e) => (e.company_id, e.request_id),
            QuotationRequestEvent::RequestRevised(e) => (e.company_id, e.request_id),
            QuotationRequestEvent::MarginSet(e) => (e.company_id, e.request_id),
            QuotationRequestEvent::SubmittedForPurchase(e) => (e.company_id, e.request_id),
            QuotationRequestEvent::PurchasePriceImported(e) => (e.company_id, e.request_id),
            QuotationRequestEvent::RequestFinalized(e) => (e.company_id, e.request_id),
            QuotationRequestEvent::RequestWithdrawn(e) => (e.company_id, e.request_id),
        };
        if event_company != company_id {
            return Err(RequestDirectoryError::CompanyIsolation(
                "event company_id does not match envelope company_id".to_string(),
            ));
        }
        if request_id.0 != aggregate_id {
            return Err(RequestDirectoryError::CompanyIsolation(
                "event request_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            QuotationRequestEvent::RequestCreated(e) => {
                self.store.upsert(
                    company_id,
                    e.request_id,
                    RequestSummary {
                        request_id: e.request_id,
                        reference: e.reference,
                        stage: Stage::New,
                        priority: e.priority,
                        product_id: e.product_id,
                        quantity: e.quantity,
                        origin: e.sales.origin,
                        purchase_line: None,
                        final_sale_value: None,
                        completed_on: None,
                    },
                );
            }
            QuotationRequestEvent::RequestRevised(e) => {
                if let Some(mut rm) = self.store.get(company_id, &e.request_id) {
                    if let Some(product_id) = e.revision.product_id {
                        rm.product_id = product_id;
                    }
                    if let Some(quantity) = e.revision.quantity {
                        rm.quantity = quantity;
                    }
                    if let Some(priority) = e.revision.priority {
                        rm.priority = priority;
                    }
                    self.store.upsert(company_id, e.request_id, rm);
                }
            }
            QuotationRequestEvent::SubmittedForPurchase(e) => {
                if let Some(mut rm) = self.store.get(company_id, &e.request_id) {
                    rm.stage = Stage::InProgress;
                    rm.purchase_line = Some(e.purchase_line);
                    self.store.upsert(company_id, e.request_id, rm);
                }
            }
            QuotationRequestEvent::RequestFinalized(e) => {
                if let Some(mut rm) = self.store.get(company_id, &e.request_id) {
                    rm.stage = Stage::Done;
                    rm.final_sale_value = Some(e.final_sale_value);
                    rm.completed_on = Some(e.completed_on);
                    self.store.upsert(company_id, e.request_id, rm);
                }
            }
            QuotationRequestEvent::RequestWithdrawn(e) => {
                self.store.remove(company_id, &e.request_id);
            }
            QuotationRequestEvent::MarginSet(_)
            | QuotationRequestEvent::PurchasePriceImported(_) => {}
        }

        self.update_cursor(company_id, aggregate_id, seq);
        Ok(())
    }

    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), RequestDirectoryError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        {
            let mut companies = envs.iter().map(|e| e.company_id()).collect::<Vec<_>>();
            companies.sort_by_key(|c| *c.as_uuid().as_bytes());
            companies.dedup();
            for c in companies {
                self.store.clear_company(c);
                self.clear_cursors(c);
            }
        }

        envs.sort_by_key(|e| {
            (
                *e.company_id().as_uuid().as_bytes(),
                *e.aggregate_id().as_uuid().as_bytes(),
                e.sequence_number(),
            )
        });

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quoteflow_quotation::{
        PurchasingTerms, RequestCreated, RequestWithdrawn, SalesContext, SubmittedForPurchase,
    };
    use quoteflow_core::{CurrencyCode, PartyId};
    use quoteflow_sales::SalesOrderId;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use crate::read_model::InMemoryCompanyStore;

    fn envelope(
        company_id: CompanyId,
        request_id: QuotationRequestId,
        seq: u64,
        ev: &QuotationRequestEvent,
    ) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            Uuid::now_v7(),
            company_id,
            request_id.0,
            AGGREGATE_TYPE,
            "quotation.request.test",
            seq,
            serde_json::to_value(ev).unwrap(),
        )
    }

    fn created(
        company_id: CompanyId,
        request_id: QuotationRequestId,
        origin: Option<SalesLineRef>,
    ) -> QuotationRequestEvent {
        QuotationRequestEvent::RequestCreated(RequestCreated {
            company_id,
            request_id,
            reference: "RFQ/00007".to_string(),
            product_id: ProductId::new(),
            category_id: None,
            quantity: dec!(3),
            priority: Priority::Normal,
            terms: PurchasingTerms::default(),
            sales: SalesContext {
                origin,
                ..SalesContext::default()
            },
            period_start: None,
            period_stop: None,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn tracks_stage_purchase_line_and_origin() {
        let directory = RequestDirectory::new(InMemoryCompanyStore::new());
        let company_id = CompanyId::new();
        let request_id = QuotationRequestId::new(AggregateId::new());
        let line = SalesLineRef {
            order_id: SalesOrderId::new(AggregateId::new()),
            line_no: 1,
        };
        let purchase_line = PurchaseLineRef {
            order_id: PurchaseOrderId::new(AggregateId::new()),
            line_no: 1,
        };

        let created_event = created(company_id, request_id, Some(line));
        directory
            .apply_envelope(&envelope(company_id, request_id, 1, &created_event))
            .unwrap();
        assert_eq!(directory.open_for_line(company_id, line).len(), 1);
        assert_eq!(directory.by_stage(company_id, Stage::New).len(), 1);

        let submitted = QuotationRequestEvent::SubmittedForPurchase(SubmittedForPurchase {
            company_id,
            request_id,
            purchase_line,
            counterparty: PartyId::new(),
            currency: CurrencyCode::parse("USD").unwrap(),
            occurred_at: Utc::now(),
        });
        directory
            .apply_envelope(&envelope(company_id, request_id, 2, &submitted))
            .unwrap();
        // Replays are ignored.
        directory
            .apply_envelope(&envelope(company_id, request_id, 2, &submitted))
            .unwrap();

        let linked = directory.by_purchase_order(company_id, purchase_line.order_id);
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].stage, Stage::InProgress);
        assert!(directory.list(CompanyId::new()).is_empty());
    }

    #[test]
    fn withdrawn_requests_leave_the_directory() {
        let directory = RequestDirectory::new(InMemoryCompanyStore::new());
        let company_id = CompanyId::new();
        let request_id = QuotationRequestId::new(AggregateId::new());

        let created_event = created(company_id, request_id, None);
        directory
            .apply_envelope(&envelope(company_id, request_id, 1, &created_event))
            .unwrap();
        let withdrawn = QuotationRequestEvent::RequestWithdrawn(RequestWithdrawn {
            company_id,
            request_id,
            origin: None,
            occurred_at: Utc::now(),
        });
        directory
            .apply_envelope(&envelope(company_id, request_id, 2, &withdrawn))
            .unwrap();

        assert!(directory.get(company_id, &request_id).is_none());
    }

    #[test]
    fn sequence_gaps_are_rejected() {
        let directory = RequestDirectory::new(InMemoryCompanyStore::new());
        let company_id = CompanyId::new();
        let request_id = QuotationRequestId::new(AggregateId::new());

        let created_event = created(company_id, request_id, None);
        let err = directory
            .apply_envelope(&envelope(company_id, request_id, 3, &created_event))
            .unwrap_err();
        assert!(matches!(err, RequestDirectoryError::NonMonotonicSequence { last: 0, found: 3 }));
    }
}
