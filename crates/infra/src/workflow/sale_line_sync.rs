//! Sales documents and the "request quotation" toggle.
//!
//! Toggling a sales line emits `RequestToggled`; the reaction (create and link
//! a request, or withdraw and unlink it) is decided and committed in the same
//! unit of work as the toggle itself, so the sales order's stream version
//! guards the one-open-request-per-line rule.

use serde_json::Value as JsonValue;

use quoteflow_core::{
    CategoryId, CurrencyCode, DomainError, PartyId, PricelistId, ProductId, UserId,
};
use quoteflow_events::{EventBus, EventEnvelope};
use quoteflow_quotation::{
    CreateRequest, Priority, PurchasingTerms, QuotationRequest, QuotationRequestCommand,
    QuotationRequestId, SalesContext, Stage, Withdraw,
};
use quoteflow_sales::{
    AddLine, CreateSalesOrder, LinkQuotationRequest, RequestToggled, SalesLine, SalesLineRef,
    SalesOrder, SalesOrderCommand, SalesOrderEvent, SalesOrderId, SetQuoteRequested,
    UnlinkQuotationRequest,
};
use rust_decimal::Decimal;

use crate::command_dispatcher::{Tracked, UnitOfWork};
use crate::event_store::EventStore;
use crate::projections::quotation_requests::RequestSummary;
use crate::read_model::CompanyStore;

use super::{LifecycleController, OperationContext, WorkflowResult, new_aggregate_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSalesOrder {
    pub customer_id: PartyId,
    pub pricelist_id: Option<PricelistId>,
    /// Defaults to the company currency.
    pub currency: Option<CurrencyCode>,
    pub salesperson: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSalesLine {
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub quote_requested: bool,
}

/// What the sync did in reaction to a toggle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// A request was created and linked to the line.
    Created(QuotationRequestId),
    /// The line already had a request; nothing changed.
    AlreadyLinked(QuotationRequestId),
    /// The linked `new` request was withdrawn and unlinked.
    Withdrawn(QuotationRequestId),
    /// The linked request is past `new`; it stays as it is.
    Decoupled(QuotationRequestId),
    Unchanged,
}

impl<S, B, D> LifecycleController<S, B, D>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    D: CompanyStore<QuotationRequestId, RequestSummary>,
{
    pub fn create_sales_order(
        &self,
        ctx: &OperationContext,
        input: NewSalesOrder,
    ) -> WorkflowResult<SalesOrderId> {
        let order_id = SalesOrderId::new(new_aggregate_id());
        self.dispatcher().dispatch(
            ctx.company_id,
            order_id.0,
            quoteflow_sales::AGGREGATE_TYPE,
            SalesOrderCommand::CreateSalesOrder(CreateSalesOrder {
                company_id: ctx.company_id,
                order_id,
                customer_id: input.customer_id,
                pricelist_id: input.pricelist_id,
                currency: input.currency.unwrap_or_else(|| ctx.company_currency.clone()),
                salesperson: input.salesperson,
                occurred_at: ctx.now,
            }),
            |id| SalesOrder::empty(SalesOrderId::new(id)),
        )?;

        tracing::info!(company_id = %ctx.company_id, order_id = %order_id, "sales order created");
        Ok(order_id)
    }

    /// Add a line; a line added with the toggle on gets its request at once.
    #[tracing::instrument(
        skip(self, ctx, input),
        fields(company_id = %ctx.company_id, order_id = %order_id)
    )]
    pub fn add_sales_line(
        &self,
        ctx: &OperationContext,
        order_id: SalesOrderId,
        input: NewSalesLine,
    ) -> WorkflowResult<(SalesLineRef, ToggleOutcome)> {
        let mut order = self.load_sales_order(ctx.company_id, order_id)?;
        let events = order.execute(&SalesOrderCommand::AddLine(AddLine {
            company_id: ctx.company_id,
            order_id,
            product_id: input.product_id,
            category_id: input.category_id,
            quantity: input.quantity,
            unit_price: input.unit_price,
            quote_requested: input.quote_requested,
            occurred_at: ctx.now,
        }))?;

        let line = events
            .iter()
            .find_map(|event| match event {
                SalesOrderEvent::LineAdded(e) => Some(SalesLineRef {
                    order_id,
                    line_no: e.line_no,
                }),
                _ => None,
            })
            .ok_or_else(|| DomainError::invariant("sales line was not added"))?;

        let mut unit = UnitOfWork::new();
        let outcome = self.react_to_toggles(ctx, &mut order, &events, &mut unit)?;
        unit.stage(&mut order);

        let committed = self.dispatcher().commit(unit)?;
        self.follow(&committed)?;
        Ok((line, outcome))
    }

    /// Flip the "request quotation" toggle of a sales line and sync its request.
    #[tracing::instrument(skip(self, ctx), fields(company_id = %ctx.company_id, line = %line))]
    pub fn toggle_sync(
        &self,
        ctx: &OperationContext,
        line: SalesLineRef,
        enabled: bool,
    ) -> WorkflowResult<ToggleOutcome> {
        let mut order = self.load_sales_order(ctx.company_id, line.order_id)?;
        let events = order.execute(&SalesOrderCommand::SetQuoteRequested(SetQuoteRequested {
            company_id: ctx.company_id,
            order_id: line.order_id,
            line_no: line.line_no,
            enabled,
            occurred_at: ctx.now,
        }))?;

        let mut unit = UnitOfWork::new();
        let outcome = self.react_to_toggles(ctx, &mut order, &events, &mut unit)?;
        unit.stage(&mut order);

        let committed = self.dispatcher().commit(unit)?;
        self.follow(&committed)?;

        tracing::info!(?outcome, enabled, "sales line toggle synced");
        Ok(outcome)
    }

    /// Stage the request side of every `RequestToggled` among `events`.
    ///
    /// The order itself is left for the caller to stage.
    fn react_to_toggles(
        &self,
        ctx: &OperationContext,
        order: &mut Tracked<SalesOrder>,
        events: &[SalesOrderEvent],
        unit: &mut UnitOfWork,
    ) -> WorkflowResult<ToggleOutcome> {
        let mut outcome = ToggleOutcome::Unchanged;
        for event in events {
            if let SalesOrderEvent::RequestToggled(toggled) = event {
                outcome = self.react_to_toggle(ctx, order, toggled, unit)?;
            }
        }
        Ok(outcome)
    }

    fn react_to_toggle(
        &self,
        ctx: &OperationContext,
        order: &mut Tracked<SalesOrder>,
        toggled: &RequestToggled,
        unit: &mut UnitOfWork,
    ) -> WorkflowResult<ToggleOutcome> {
        let origin = toggled.line();
        let line = order.state().line(origin.line_no).cloned().ok_or_else(|| {
            DomainError::invariant(format!("toggled sales line {origin} does not exist"))
        })?;

        let linked = match line.quotation_request {
            Some(id) => Some(self.load_request(ctx.company_id, QuotationRequestId::new(id))?),
            None => None,
        };
        let open = self.directory().open_for_line(ctx.company_id, origin);
        check_line_links(origin, &line, linked.as_ref().map(Tracked::state), &open)?;

        match (toggled.enabled, linked) {
            (true, Some(existing)) => Ok(ToggleOutcome::AlreadyLinked(existing.state().id_typed())),
            (true, None) => {
                let sales = line_sales_context(ctx, order.state(), &line, origin)?;
                let request_id = QuotationRequestId::new(new_aggregate_id());
                let mut request = self.load_request(ctx.company_id, request_id)?;
                let reference = self.next_reference(ctx.company_id)?;

                request.execute(&QuotationRequestCommand::CreateRequest(CreateRequest {
                    company_id: ctx.company_id,
                    request_id,
                    reference: reference.clone(),
                    product_id: line.product_id,
                    category_id: line.category_id,
                    quantity: line.quantity,
                    priority: Priority::Normal,
                    terms: PurchasingTerms::default(),
                    sales,
                    period_start: None,
                    period_stop: None,
                    occurred_at: ctx.now,
                }))?;
                order.execute(&SalesOrderCommand::LinkQuotationRequest(LinkQuotationRequest {
                    company_id: ctx.company_id,
                    order_id: origin.order_id,
                    line_no: origin.line_no,
                    request_id: request_id.0,
                    occurred_at: ctx.now,
                }))?;
                unit.stage(&mut request);

                tracing::info!(
                    reference = %reference,
                    line = %origin,
                    "request created for sales line"
                );
                Ok(ToggleOutcome::Created(request_id))
            }
            (false, Some(mut existing)) if existing.state().stage() == Stage::New => {
                let request_id = existing.state().id_typed();
                existing.execute(&QuotationRequestCommand::Withdraw(Withdraw {
                    company_id: ctx.company_id,
                    request_id,
                    occurred_at: ctx.now,
                }))?;
                order.execute(&SalesOrderCommand::UnlinkQuotationRequest(
                    UnlinkQuotationRequest {
                        company_id: ctx.company_id,
                        order_id: origin.order_id,
                        line_no: origin.line_no,
                        request_id: request_id.0,
                        occurred_at: ctx.now,
                    },
                ))?;
                unit.stage(&mut existing);

                tracing::info!(
                    reference = %existing.state().reference(),
                    line = %origin,
                    "request withdrawn"
                );
                Ok(ToggleOutcome::Withdrawn(request_id))
            }
            (false, Some(existing)) => {
                let request = existing.state();
                tracing::warn!(
                    reference = %request.reference(),
                    stage = %request.stage(),
                    line = %origin,
                    "toggle switched off after the request left stage new; request kept"
                );
                Ok(ToggleOutcome::Decoupled(request.id_typed()))
            }
            (false, None) => Ok(ToggleOutcome::Unchanged),
        }
    }
}

/// Sales context of a request raised for `line`.
pub(crate) fn line_sales_context(
    ctx: &OperationContext,
    order: &SalesOrder,
    line: &SalesLine,
    origin: SalesLineRef,
) -> Result<SalesContext, DomainError> {
    Ok(SalesContext {
        origin: Some(origin),
        customer_id: order.customer_id(),
        pricelist_id: order.pricelist_id(),
        currency: order.currency().cloned(),
        responsible: order.salesperson().or(Some(ctx.user_id)),
        sales_value_snapshot: Some(line.subtotal()?),
    })
}

/// A line knows at most one live request, and that request originates from
/// the line. `open` lists the open requests whose origin is the line.
pub(crate) fn check_line_links(
    origin: SalesLineRef,
    line: &SalesLine,
    linked: Option<&QuotationRequest>,
    open: &[RequestSummary],
) -> Result<(), DomainError> {
    if let Some(stray) = open
        .iter()
        .find(|summary| Some(summary.request_id.0) != line.quotation_request)
    {
        tracing::error!(
            line = %origin,
            reference = %stray.reference,
            "open request for sales line is not linked to it"
        );
        return Err(DomainError::duplicate_link(
            origin.to_string(),
            format!("open request '{}' is not linked to the line", stray.reference),
        ));
    }

    if let Some(request) = linked {
        if !request.is_created() || request.is_withdrawn() {
            tracing::error!(
                line = %origin,
                request_id = %request.id_typed(),
                "sales line links a missing request"
            );
            return Err(DomainError::invariant(format!(
                "sales line {origin} links request {} which does not exist",
                request.id_typed()
            )));
        }
        if request.origin() != Some(origin) {
            tracing::error!(
                line = %origin,
                reference = %request.reference(),
                "linked request originates from another sales line"
            );
            return Err(DomainError::duplicate_link(
                request.reference(),
                format!("linked from sales line {origin} but originates elsewhere"),
            ));
        }
    }

    Ok(())
}
