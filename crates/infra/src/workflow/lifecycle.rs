//! Request lifecycle operations: create, submit for purchase, import prices,
//! finalize, plus the edits allowed along the way.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use quoteflow_core::{CategoryId, DomainError, ProductId};
use quoteflow_events::{EventBus, EventEnvelope};
use quoteflow_purchasing::{
    AddLine as AddPurchaseLine, CreatePurchaseOrder, PurchaseLineRef, PurchaseOrder,
    PurchaseOrderCommand, PurchaseOrderEvent, PurchaseOrderId, RecordSupplierQuote,
};
use quoteflow_quotation::{
    CreateRequest, Finalize, ImportPurchasePrice, Margin, MarkAggregated, Priority,
    PurchasingTerms, QuotationRequest, QuotationRequestCommand, QuotationRequestEvent,
    QuotationRequestId, RequestRevision, ReviseRequest, SalesContext, SetMargin, Stage,
    plan_purchase_orders,
};
use quoteflow_sales::{
    ApplyQuotedPrice, LinkQuotationRequest, SalesLineRef, SalesOrder, SalesOrderCommand,
    SalesOrderId, UnlinkQuotationRequest,
};

use crate::command_dispatcher::{DispatchError, Tracked, UnitOfWork};
use crate::event_store::EventStore;
use crate::projections::quotation_requests::RequestSummary;
use crate::read_model::CompanyStore;

use super::sale_line_sync::{check_line_links, line_sales_context};
use super::{
    LifecycleController, OperationContext, WorkflowResult, distinct, new_aggregate_id,
};

/// Input of [`LifecycleController::create_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    pub quantity: Decimal,
    pub priority: Priority,
    pub terms: PurchasingTerms,
    pub period_start: Option<DateTime<Utc>>,
    pub period_stop: Option<DateTime<Utc>>,
    /// Sales line the request is raised for. The line gets linked to it.
    pub origin: Option<SalesLineRef>,
}

impl NewRequest {
    pub fn new(product_id: ProductId, quantity: Decimal) -> Self {
        Self {
            product_id,
            category_id: None,
            quantity,
            priority: Priority::default(),
            terms: PurchasingTerms::default(),
            period_start: None,
            period_stop: None,
            origin: None,
        }
    }

    pub fn for_line(mut self, origin: SalesLineRef) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl<S, B, D> LifecycleController<S, B, D>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    D: CompanyStore<QuotationRequestId, RequestSummary>,
{
    /// Create a request in stage `new`.
    ///
    /// With an origin, the sales line is linked to the new request in the same
    /// commit. A line that already has an open request is rejected.
    #[tracing::instrument(
        skip(self, ctx, input),
        fields(company_id = %ctx.company_id, product_id = %input.product_id)
    )]
    pub fn create_request(
        &self,
        ctx: &OperationContext,
        input: NewRequest,
    ) -> WorkflowResult<QuotationRequestId> {
        let request_id = QuotationRequestId::new(new_aggregate_id());
        let mut request = self.load_request(ctx.company_id, request_id)?;
        let mut unit = UnitOfWork::new();

        let (sales, mut order) = match input.origin {
            Some(origin) => {
                let order = self.load_sales_order(ctx.company_id, origin.order_id)?;
                let sales = self.claim_line(ctx, order.state(), origin)?;
                (sales, Some(order))
            }
            None => (
                SalesContext {
                    responsible: Some(ctx.user_id),
                    ..SalesContext::default()
                },
                None,
            ),
        };

        let reference = self.next_reference(ctx.company_id)?;
        request.execute(&QuotationRequestCommand::CreateRequest(CreateRequest {
            company_id: ctx.company_id,
            request_id,
            reference: reference.clone(),
            product_id: input.product_id,
            category_id: input.category_id,
            quantity: input.quantity,
            priority: input.priority,
            terms: input.terms,
            sales,
            period_start: input.period_start,
            period_stop: input.period_stop,
            occurred_at: ctx.now,
        }))?;
        unit.stage(&mut request);

        if let (Some(order), Some(origin)) = (order.as_mut(), input.origin) {
            link_line(ctx, order, origin, request_id)?;
            unit.stage(order);
        }

        let committed = self.dispatcher().commit(unit)?;
        self.follow(&committed)?;

        tracing::info!(reference = %reference, origin = ?input.origin, "quotation request created");
        Ok(request_id)
    }

    /// Raise a request straight from a sales line, copying its product,
    /// category and quantity.
    pub fn request_quote_for_line(
        &self,
        ctx: &OperationContext,
        line: SalesLineRef,
        terms: PurchasingTerms,
        priority: Priority,
    ) -> WorkflowResult<QuotationRequestId> {
        let order = self.sales_order(ctx.company_id, line.order_id)?;
        let sales_line = order.line(line.line_no).ok_or_else(|| {
            DomainError::validation(format!("sales line {} does not exist", line.line_no))
        })?;

        let input = NewRequest {
            category_id: sales_line.category_id,
            priority,
            terms,
            ..NewRequest::new(sales_line.product_id, sales_line.quantity)
        }
        .for_line(line);

        self.create_request(ctx, input)
    }

    /// Edit a request that is still `new`.
    #[tracing::instrument(
        skip(self, ctx, revision),
        fields(company_id = %ctx.company_id, request_id = %request_id)
    )]
    pub fn revise_request(
        &self,
        ctx: &OperationContext,
        request_id: QuotationRequestId,
        revision: RequestRevision,
    ) -> WorkflowResult<bool> {
        let events = self.run_request_command(
            ctx,
            request_id,
            QuotationRequestCommand::ReviseRequest(ReviseRequest {
                company_id: ctx.company_id,
                request_id,
                revision,
                occurred_at: ctx.now,
            }),
        )?;
        Ok(!events.is_empty())
    }

    /// Set the margin of a `new` or `in_progress` request.
    #[tracing::instrument(
        skip(self, ctx),
        fields(company_id = %ctx.company_id, request_id = %request_id)
    )]
    pub fn set_margin(
        &self,
        ctx: &OperationContext,
        request_id: QuotationRequestId,
        margin: Margin,
    ) -> WorkflowResult<bool> {
        let events = self.run_request_command(
            ctx,
            request_id,
            QuotationRequestCommand::SetMargin(SetMargin {
                company_id: ctx.company_id,
                request_id,
                margin,
                occurred_at: ctx.now,
            }),
        )?;
        Ok(!events.is_empty())
    }

    /// Submit a batch of `new` requests for purchase.
    ///
    /// Creates one purchase order per grouping key with one line per request
    /// and moves every request to `in_progress`. The whole batch is validated
    /// before anything is created; it commits entirely or not at all.
    #[tracing::instrument(
        skip(self, ctx, request_ids),
        fields(company_id = %ctx.company_id, requests = request_ids.len())
    )]
    pub fn aggregate(
        &self,
        ctx: &OperationContext,
        request_ids: &[QuotationRequestId],
    ) -> WorkflowResult<Vec<PurchaseOrderId>> {
        let ids = distinct(request_ids);
        let mut requests = ids
            .iter()
            .map(|id| self.load_request(ctx.company_id, *id))
            .collect::<Result<Vec<_>, _>>()?;

        let plans = {
            let states: Vec<&QuotationRequest> = requests.iter().map(Tracked::state).collect();
            let strategy = self.config().grouping_strategy;
            plan_purchase_orders(&states, strategy, &ctx.grouping_defaults())?
        };

        let position: HashMap<QuotationRequestId, usize> =
            ids.iter().enumerate().map(|(idx, id)| (*id, idx)).collect();

        let mut unit = UnitOfWork::new();
        let mut created = Vec::with_capacity(plans.len());

        for plan in &plans {
            let order_id = PurchaseOrderId::new(new_aggregate_id());
            let mut order = self.load_purchase_order(ctx.company_id, order_id)?;
            order.execute(&PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
                company_id: ctx.company_id,
                order_id,
                counterparty: plan.key.counterparty,
                currency: plan.key.currency.clone(),
                date_planned: plan.date_planned,
                occurred_at: ctx.now,
            }))?;

            for member in &plan.members {
                let request = position
                    .get(member)
                    .and_then(|idx| requests.get_mut(*idx))
                    .ok_or_else(|| {
                        DomainError::invariant(format!("planned request {member} was not loaded"))
                    })?;

                let purchase_line = add_purchase_line(ctx, &mut order, request.state())?;

                request.execute(&QuotationRequestCommand::MarkAggregated(MarkAggregated {
                    company_id: ctx.company_id,
                    request_id: *member,
                    purchase_line,
                    counterparty: plan.key.counterparty,
                    currency: plan.key.currency.clone(),
                    occurred_at: ctx.now,
                }))?;
            }

            tracing::debug!(
                order_id = %order_id,
                counterparty = %plan.key.counterparty,
                currency = %plan.key.currency,
                lines = plan.members.len(),
                "purchase order planned"
            );
            unit.stage(&mut order);
            created.push(order_id);
        }

        for request in &mut requests {
            unit.stage(request);
        }

        let committed = self.dispatcher().commit(unit)?;
        self.follow(&committed)?;

        tracing::info!(
            orders = created.len(),
            requests = ids.len(),
            strategy = %self.config().grouping_strategy,
            "requests submitted for purchase"
        );
        Ok(created)
    }

    /// Copy the quoted price of each request's purchase line into the request.
    ///
    /// Requests outside `in_progress`, and lines without a positive price, are
    /// skipped. Returns how many requests changed.
    #[tracing::instrument(
        skip(self, ctx, request_ids),
        fields(company_id = %ctx.company_id, requests = request_ids.len())
    )]
    pub fn import_price(
        &self,
        ctx: &OperationContext,
        request_ids: &[QuotationRequestId],
    ) -> WorkflowResult<usize> {
        let mut orders: HashMap<PurchaseOrderId, PurchaseOrder> = HashMap::new();
        let mut unit = UnitOfWork::new();
        let mut imported = 0;

        for request_id in distinct(request_ids) {
            let mut request = self.load_request(ctx.company_id, request_id)?;
            let state = request.state();
            if !state.is_created() || state.is_withdrawn() {
                return Err(DispatchError::NotFound.into());
            }
            if state.stage() != Stage::InProgress {
                tracing::debug!(
                    reference = %state.reference(),
                    stage = %state.stage(),
                    "import skipped: request is not in progress"
                );
                continue;
            }

            let line_ref = state.purchase_line().ok_or_else(|| {
                DomainError::invariant(format!(
                    "request '{}' is in progress without a purchase line",
                    state.reference()
                ))
            })?;
            let default_margin = state
                .category_id()
                .and_then(|category| self.margins().default_margin(ctx.company_id, category));
            let reference = state.reference().to_string();

            let order = match orders.entry(line_ref.order_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    entry.insert(self.purchase_order(ctx.company_id, line_ref.order_id)?)
                }
            };
            let supplier_price = order
                .line(line_ref.line_no)
                .map(|line| line.unit_price)
                .ok_or_else(|| {
                    DomainError::invariant(format!(
                        "purchase line {} of order {} does not exist",
                        line_ref.line_no, line_ref.order_id
                    ))
                })?;

            let events = request.execute(&QuotationRequestCommand::ImportPurchasePrice(
                ImportPurchasePrice {
                    company_id: ctx.company_id,
                    request_id,
                    supplier_price,
                    default_margin,
                    occurred_at: ctx.now,
                },
            ))?;

            if events.is_empty() {
                tracing::debug!(
                    reference = %reference,
                    %supplier_price,
                    "import skipped: nothing to copy"
                );
            } else {
                imported += 1;
            }
            unit.stage(&mut request);
        }

        let committed = self.dispatcher().commit(unit)?;
        self.follow(&committed)?;

        tracing::info!(imported, "purchase prices imported");
        Ok(imported)
    }

    /// Import prices for every in-progress request placed on the given order.
    pub fn import_prices_for_order(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
    ) -> WorkflowResult<usize> {
        let ids: Vec<QuotationRequestId> = self
            .requests_for_order(ctx, order_id)
            .into_iter()
            .filter(|summary| summary.stage == Stage::InProgress)
            .map(|summary| summary.request_id)
            .collect();

        if ids.is_empty() {
            tracing::debug!(order_id = %order_id, "no in-progress requests on purchase order");
            return Ok(0);
        }
        self.import_price(ctx, &ids)
    }

    /// Requests placed on the lines of a purchase order, in line order.
    pub fn requests_for_order(
        &self,
        ctx: &OperationContext,
        order_id: PurchaseOrderId,
    ) -> Vec<RequestSummary> {
        self.directory().by_purchase_order(ctx.company_id, order_id)
    }

    /// Record the supplier's quoted unit price on a purchase line.
    #[tracing::instrument(skip(self, ctx), fields(company_id = %ctx.company_id))]
    pub fn record_supplier_quote(
        &self,
        ctx: &OperationContext,
        line: PurchaseLineRef,
        unit_price: Decimal,
    ) -> WorkflowResult<()> {
        let mut order = self.load_purchase_order(ctx.company_id, line.order_id)?;
        order.execute(&PurchaseOrderCommand::RecordSupplierQuote(RecordSupplierQuote {
            company_id: ctx.company_id,
            order_id: line.order_id,
            line_no: line.line_no,
            unit_price,
            occurred_at: ctx.now,
        }))?;

        let mut unit = UnitOfWork::new();
        unit.stage(&mut order);
        self.dispatcher().commit(unit)?;

        tracing::info!(
            order_id = %line.order_id,
            line_no = line.line_no,
            %unit_price,
            "supplier quote recorded"
        );
        Ok(())
    }

    /// Close a batch of `in_progress` requests.
    ///
    /// Computes each request's final sale value and writes it to the unit
    /// price of its originating sales line. Any failing request fails the
    /// batch before anything is committed.
    #[tracing::instrument(
        skip(self, ctx, request_ids),
        fields(company_id = %ctx.company_id, requests = request_ids.len())
    )]
    pub fn finalize(
        &self,
        ctx: &OperationContext,
        request_ids: &[QuotationRequestId],
    ) -> WorkflowResult<usize> {
        let ids = distinct(request_ids);
        if ids.is_empty() {
            return Err(
                DomainError::no_eligible_requests("no requests were selected for finalization")
                    .into(),
            );
        }

        let mut requests = Vec::with_capacity(ids.len());
        let mut orders: HashMap<SalesOrderId, Tracked<SalesOrder>> = HashMap::new();

        for request_id in ids {
            let mut request = self.load_request(ctx.company_id, request_id)?;
            let events = request.execute(&QuotationRequestCommand::Finalize(Finalize {
                company_id: ctx.company_id,
                request_id,
                completed_on: ctx.today(),
                occurred_at: ctx.now,
            }))?;

            for event in &events {
                let QuotationRequestEvent::RequestFinalized(done) = event else {
                    continue;
                };
                if let Some(origin) = done.origin {
                    let order = match orders.entry(origin.order_id) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => {
                            entry.insert(self.load_sales_order(ctx.company_id, origin.order_id)?)
                        }
                    };
                    order.execute(&SalesOrderCommand::ApplyQuotedPrice(ApplyQuotedPrice {
                        company_id: ctx.company_id,
                        order_id: origin.order_id,
                        line_no: origin.line_no,
                        unit_price: done.final_sale_value,
                        occurred_at: ctx.now,
                    }))?;
                }
                tracing::info!(
                    reference = %request.state().reference(),
                    final_sale_value = %done.final_sale_value,
                    origin = ?done.origin,
                    "request finalized"
                );
            }

            requests.push(request);
        }

        let mut unit = UnitOfWork::new();
        for request in &mut requests {
            unit.stage(request);
        }
        for order in orders.values_mut() {
            unit.stage(order);
        }

        let committed = self.dispatcher().commit(unit)?;
        self.follow(&committed)?;
        Ok(requests.len())
    }

    fn run_request_command(
        &self,
        ctx: &OperationContext,
        request_id: QuotationRequestId,
        command: QuotationRequestCommand,
    ) -> WorkflowResult<Vec<QuotationRequestEvent>> {
        let mut request = self.load_request(ctx.company_id, request_id)?;
        let events = request.execute(&command)?;

        let mut unit = UnitOfWork::new();
        unit.stage(&mut request);
        let committed = self.dispatcher().commit(unit)?;
        self.follow(&committed)?;
        Ok(events)
    }

    /// Check that a sales line may receive a new request and derive the
    /// request's sales context from it.
    fn claim_line(
        &self,
        ctx: &OperationContext,
        order: &SalesOrder,
        origin: SalesLineRef,
    ) -> WorkflowResult<SalesContext> {
        if !order.is_created() {
            return Err(DispatchError::NotFound.into());
        }
        let line = order.line(origin.line_no).ok_or_else(|| {
            DomainError::validation(format!("sales line {} does not exist", origin.line_no))
        })?;

        let linked = match line.quotation_request {
            Some(id) => Some(self.load_request(ctx.company_id, QuotationRequestId::new(id))?),
            None => None,
        };
        let open = self.directory().open_for_line(ctx.company_id, origin);
        check_line_links(origin, line, linked.as_ref().map(Tracked::state), &open)?;

        if let Some(existing) = linked.as_ref().map(Tracked::state) {
            if existing.is_open() {
                return Err(DomainError::precondition(
                    existing.reference(),
                    format!("sales line {origin} already has an open request"),
                )
                .into());
            }
        }

        Ok(line_sales_context(ctx, order, line, origin)?)
    }
}

/// Point the line at `request_id`, replacing a link to a closed request.
fn link_line(
    ctx: &OperationContext,
    order: &mut Tracked<SalesOrder>,
    origin: SalesLineRef,
    request_id: QuotationRequestId,
) -> Result<(), DispatchError> {
    let previous = order
        .state()
        .line(origin.line_no)
        .and_then(|line| line.quotation_request);

    if let Some(previous) = previous {
        order.execute(&SalesOrderCommand::UnlinkQuotationRequest(UnlinkQuotationRequest {
            company_id: ctx.company_id,
            order_id: origin.order_id,
            line_no: origin.line_no,
            request_id: previous,
            occurred_at: ctx.now,
        }))?;
    }

    order.execute(&SalesOrderCommand::LinkQuotationRequest(LinkQuotationRequest {
        company_id: ctx.company_id,
        order_id: origin.order_id,
        line_no: origin.line_no,
        request_id: request_id.0,
        occurred_at: ctx.now,
    }))?;
    Ok(())
}

/// Add the purchase line for one request; returns its address.
fn add_purchase_line(
    ctx: &OperationContext,
    order: &mut Tracked<PurchaseOrder>,
    request: &QuotationRequest,
) -> Result<PurchaseLineRef, DispatchError> {
    let product_id = request.product_id().ok_or_else(|| {
        DomainError::invariant(format!("request '{}' has no product", request.reference()))
    })?;

    let added = order.execute(&PurchaseOrderCommand::AddLine(AddPurchaseLine {
        company_id: ctx.company_id,
        order_id: order.state().id_typed(),
        product_id,
        quantity: request.quantity(),
        unit_price: request.initial_purchase_price().unwrap_or(Decimal::ZERO),
        description: request.reference().to_string(),
        occurred_at: ctx.now,
    }))?;

    added
        .iter()
        .find_map(|event| match event {
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => Some(e.line()),
            _ => None,
        })
        .ok_or_else(|| DomainError::invariant("purchase line was not added").into())
}
