//! Quotation request workflow (application services).
//!
//! Every operation loads the aggregates it touches, decides in memory and
//! commits them as one [`UnitOfWork`](crate::command_dispatcher::UnitOfWork).
//! Committed request events are then folded into the [`RequestDirectory`].
//!
//! - [`lifecycle`]: create, aggregate, import, finalize and the request edits
//! - [`sale_line_sync`]: sales documents and the "request quotation" toggle

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use quoteflow_core::{AggregateId, CompanyId, CurrencyCode, PartyId, UserId};
use quoteflow_events::{EventBus, EventEnvelope};
use quoteflow_purchasing::{PurchaseOrder, PurchaseOrderId};
use quoteflow_quotation::{GroupingDefaults, QuotationRequest, QuotationRequestId};
use quoteflow_sales::{SalesOrder, SalesOrderId};

use crate::collaborators::{CategoryMarginLookup, ReferenceAllocator, ReferenceError};
use crate::command_dispatcher::{CommandDispatcher, DispatchError, Tracked};
use crate::config::WorkflowConfig;
use crate::event_store::{EventStore, StoredEvent};
use crate::projections::quotation_requests::{
    RequestDirectory, RequestDirectoryError, RequestSummary,
};
use crate::read_model::{CompanyStore, InMemoryCompanyStore};

pub mod lifecycle;
pub mod sale_line_sync;

pub use lifecycle::NewRequest;
pub use sale_line_sync::{NewSalesLine, NewSalesOrder, ToggleOutcome};

/// Who is acting, for which company, and when.
///
/// Passed explicitly to every workflow operation; nothing is read from
/// ambient state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub company_id: CompanyId,
    pub user_id: UserId,
    pub company_currency: CurrencyCode,
    /// The company's own partner record, used as placeholder counterparty.
    pub company_partner: PartyId,
    pub now: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(
        company_id: CompanyId,
        user_id: UserId,
        company_currency: CurrencyCode,
        company_partner: PartyId,
    ) -> Self {
        Self {
            company_id,
            user_id,
            company_currency,
            company_partner,
            now: Utc::now(),
        }
    }

    /// Same context at another instant.
    pub fn at(&self, now: DateTime<Utc>) -> Self {
        Self {
            now,
            ..self.clone()
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    pub(crate) fn grouping_defaults(&self) -> GroupingDefaults {
        GroupingDefaults {
            placeholder_counterparty: self.company_partner,
            company_currency: self.company_currency.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("reference allocation failed: {0}")]
    Reference(#[from] ReferenceError),
    /// The events are committed but the directory could not follow them.
    #[error("request directory is out of date: {0}")]
    Directory(#[from] RequestDirectoryError),
}

impl WorkflowError {
    pub fn is_invariant_breach(&self) -> bool {
        matches!(self, WorkflowError::Dispatch(e) if e.is_invariant_breach())
    }

    pub fn is_user_actionable(&self) -> bool {
        matches!(self, WorkflowError::Dispatch(e) if e.is_user_actionable())
    }

    /// The underlying dispatch error, if any.
    pub fn as_dispatch(&self) -> Option<&DispatchError> {
        match self {
            WorkflowError::Dispatch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<quoteflow_core::DomainError> for WorkflowError {
    fn from(value: quoteflow_core::DomainError) -> Self {
        WorkflowError::Dispatch(value.into())
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

pub type DefaultDirectoryStore = InMemoryCompanyStore<QuotationRequestId, RequestSummary>;

/// Entry point for every workflow operation.
pub struct LifecycleController<S, B, D = DefaultDirectoryStore>
where
    D: CompanyStore<QuotationRequestId, RequestSummary>,
{
    dispatcher: CommandDispatcher<S, B>,
    config: WorkflowConfig,
    references: Arc<dyn ReferenceAllocator>,
    margins: Arc<dyn CategoryMarginLookup>,
    directory: RequestDirectory<D>,
}

impl<S, B> LifecycleController<S, B, DefaultDirectoryStore> {
    /// Controller with an in-memory request directory.
    pub fn new(
        dispatcher: CommandDispatcher<S, B>,
        config: WorkflowConfig,
        references: Arc<dyn ReferenceAllocator>,
        margins: Arc<dyn CategoryMarginLookup>,
    ) -> Self {
        Self::with_directory(
            dispatcher,
            config,
            references,
            margins,
            RequestDirectory::new(InMemoryCompanyStore::new()),
        )
    }
}

impl<S, B, D> LifecycleController<S, B, D>
where
    D: CompanyStore<QuotationRequestId, RequestSummary>,
{
    pub fn with_directory(
        dispatcher: CommandDispatcher<S, B>,
        config: WorkflowConfig,
        references: Arc<dyn ReferenceAllocator>,
        margins: Arc<dyn CategoryMarginLookup>,
        directory: RequestDirectory<D>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            references,
            margins,
            directory,
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn directory(&self) -> &RequestDirectory<D> {
        &self.directory
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }
}

impl<S, B, D> LifecycleController<S, B, D>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    D: CompanyStore<QuotationRequestId, RequestSummary>,
{
    pub(crate) fn load_request(
        &self,
        company_id: CompanyId,
        request_id: QuotationRequestId,
    ) -> Result<Tracked<QuotationRequest>, DispatchError> {
        self.dispatcher.load(
            company_id,
            request_id.0,
            quoteflow_quotation::AGGREGATE_TYPE,
            |id| QuotationRequest::empty(QuotationRequestId::new(id)),
        )
    }

    pub(crate) fn load_sales_order(
        &self,
        company_id: CompanyId,
        order_id: SalesOrderId,
    ) -> Result<Tracked<SalesOrder>, DispatchError> {
        self.dispatcher.load(
            company_id,
            order_id.0,
            quoteflow_sales::AGGREGATE_TYPE,
            |id| SalesOrder::empty(SalesOrderId::new(id)),
        )
    }

    pub(crate) fn load_purchase_order(
        &self,
        company_id: CompanyId,
        order_id: PurchaseOrderId,
    ) -> Result<Tracked<PurchaseOrder>, DispatchError> {
        self.dispatcher.load(
            company_id,
            order_id.0,
            quoteflow_purchasing::AGGREGATE_TYPE,
            |id| PurchaseOrder::empty(PurchaseOrderId::new(id)),
        )
    }

    /// Current state of a request (withdrawn requests load as not found).
    pub fn request(
        &self,
        company_id: CompanyId,
        request_id: QuotationRequestId,
    ) -> WorkflowResult<QuotationRequest> {
        let tracked = self.load_request(company_id, request_id)?;
        if !tracked.state().is_created() || tracked.state().is_withdrawn() {
            return Err(DispatchError::NotFound.into());
        }
        Ok(tracked.state().clone())
    }

    pub fn sales_order(
        &self,
        company_id: CompanyId,
        order_id: SalesOrderId,
    ) -> WorkflowResult<SalesOrder> {
        let tracked = self.load_sales_order(company_id, order_id)?;
        if !tracked.state().is_created() {
            return Err(DispatchError::NotFound.into());
        }
        Ok(tracked.state().clone())
    }

    pub fn purchase_order(
        &self,
        company_id: CompanyId,
        order_id: PurchaseOrderId,
    ) -> WorkflowResult<PurchaseOrder> {
        let tracked = self.load_purchase_order(company_id, order_id)?;
        if !tracked.state().is_created() {
            return Err(DispatchError::NotFound.into());
        }
        Ok(tracked.state().clone())
    }

    /// Allocate the next request reference from the configured sequence.
    pub(crate) fn next_reference(&self, company_id: CompanyId) -> WorkflowResult<String> {
        Ok(self
            .references
            .next_reference(company_id, &self.config.sequence_name)?)
    }

    pub(crate) fn margins(&self) -> &dyn CategoryMarginLookup {
        self.margins.as_ref()
    }

    /// Fold committed events into the directory.
    pub(crate) fn follow(&self, committed: &[StoredEvent]) -> WorkflowResult<()> {
        for stored in committed {
            if let Err(err) = self.directory.apply_envelope(&stored.to_envelope()) {
                tracing::error!(
                    company_id = %stored.company_id,
                    aggregate_id = %stored.aggregate_id,
                    sequence_number = stored.sequence_number,
                    "request directory failed to apply committed event: {err}"
                );
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Rebuild the directory for one company from the event store.
    pub fn rebuild_directory(&self, company_id: CompanyId) -> WorkflowResult<usize> {
        let history = self
            .dispatcher
            .store()
            .load_by_type(company_id, quoteflow_quotation::AGGREGATE_TYPE)
            .map_err(DispatchError::from)?;
        let count = history.len();
        self.directory
            .rebuild_from_scratch(history.iter().map(StoredEvent::to_envelope))?;

        tracing::info!(company_id = %company_id, events = count, "request directory rebuilt");
        Ok(count)
    }
}

/// Keep the first occurrence of every id.
pub(crate) fn distinct<T: Copy + Eq + std::hash::Hash>(ids: &[T]) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

pub(crate) fn new_aggregate_id() -> AggregateId {
    AggregateId::new()
}
