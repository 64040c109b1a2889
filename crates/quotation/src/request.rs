use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use quoteflow_core::{
    Aggregate, AggregateId, AggregateRoot, CategoryId, CompanyId, CurrencyCode, DomainError,
    PartyId, PricelistId, ProductId, UserId,
};
use quoteflow_events::Event;
use quoteflow_purchasing::PurchaseLineRef;
use quoteflow_sales::SalesLineRef;

use crate::pricing::{self, Margin};
use crate::stage::{Priority, Stage};

/// Stream type of the quotation request aggregate.
pub const AGGREGATE_TYPE: &str = "quotation.request";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotationRequestId(pub AggregateId);

impl QuotationRequestId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for QuotationRequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Purchasing-side attributes of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchasingTerms {
    /// Optional until aggregation (required by `supplier_and_currency`).
    pub supplier_id: Option<PartyId>,
    /// Company currency is used when unset.
    pub currency: Option<CurrencyCode>,
    pub exchange_rate: Option<Decimal>,
    pub lead_time_days: Option<u32>,
    pub date_delivery: Option<NaiveDate>,
    pub initial_purchase_price: Option<Decimal>,
    pub margin: Option<Margin>,
}

/// Sales-side attributes, captured when the request originates from a sales line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesContext {
    pub origin: Option<SalesLineRef>,
    pub customer_id: Option<PartyId>,
    pub pricelist_id: Option<PricelistId>,
    pub currency: Option<CurrencyCode>,
    pub responsible: Option<UserId>,
    /// Line subtotal at creation time.
    pub sales_value_snapshot: Option<Decimal>,
}

/// Aggregate root: QuotationRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotationRequest {
    id: QuotationRequestId,
    company_id: Option<CompanyId>,
    reference: String,
    stage: Stage,
    priority: Priority,
    product_id: Option<ProductId>,
    category_id: Option<CategoryId>,
    quantity: Decimal,
    terms: PurchasingTerms,
    final_purchase_price: Option<Decimal>,
    sales: SalesContext,
    final_sale_value: Option<Decimal>,
    purchase_line: Option<PurchaseLineRef>,
    created_at: Option<DateTime<Utc>>,
    period_start: Option<DateTime<Utc>>,
    period_stop: Option<DateTime<Utc>>,
    completed_on: Option<NaiveDate>,
    withdrawn: bool,
    version: u64,
    created: bool,
}

impl QuotationRequest {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: QuotationRequestId) -> Self {
        Self {
            id,
            company_id: None,
            reference: String::new(),
            stage: Stage::New,
            priority: Priority::Normal,
            product_id: None,
            category_id: None,
            quantity: Decimal::ZERO,
            terms: PurchasingTerms::default(),
            final_purchase_price: None,
            sales: SalesContext::default(),
            final_sale_value: None,
            purchase_line: None,
            created_at: None,
            period_start: None,
            period_stop: None,
            completed_on: None,
            withdrawn: false,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> QuotationRequestId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn
    }

    /// Live and not yet done.
    pub fn is_open(&self) -> bool {
        self.created && !self.withdrawn && self.stage.is_open()
    }

    pub fn company_id(&self) -> Option<CompanyId> {
        self.company_id
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn product_id(&self) -> Option<ProductId> {
        self.product_id
    }

    pub fn category_id(&self) -> Option<CategoryId> {
        self.category_id
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn terms(&self) -> &PurchasingTerms {
        &self.terms
    }

    pub fn supplier_id(&self) -> Option<PartyId> {
        self.terms.supplier_id
    }

    pub fn purchase_currency(&self) -> Option<&CurrencyCode> {
        self.terms.currency.as_ref()
    }

    pub fn initial_purchase_price(&self) -> Option<Decimal> {
        self.terms.initial_purchase_price
    }

    pub fn margin(&self) -> Option<Margin> {
        self.terms.margin
    }

    pub fn final_purchase_price(&self) -> Option<Decimal> {
        self.final_purchase_price
    }

    pub fn sales(&self) -> &SalesContext {
        &self.sales
    }

    pub fn origin(&self) -> Option<SalesLineRef> {
        self.sales.origin
    }

    pub fn final_sale_value(&self) -> Option<Decimal> {
        self.final_sale_value
    }

    pub fn purchase_line(&self) -> Option<PurchaseLineRef> {
        self.purchase_line
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn period_start(&self) -> Option<DateTime<Utc>> {
        self.period_start
    }

    pub fn period_stop(&self) -> Option<DateTime<Utc>> {
        self.period_stop
    }

    pub fn completed_on(&self) -> Option<NaiveDate> {
        self.completed_on
    }

    fn advance(&mut self, target: Stage) {
        if self.stage.can_advance_to(target) {
            self.stage = target;
        }
    }
}

impl AggregateRoot for QuotationRequest {
    type Id = QuotationRequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateRequest. The reference is allocated by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub reference: String,
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    pub quantity: Decimal,
    pub priority: Priority,
    pub terms: PurchasingTerms,
    pub sales: SalesContext,
    pub period_start: Option<DateTime<Utc>>,
    pub period_stop: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Field edits allowed while a request is `new`. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRevision {
    pub product_id: Option<ProductId>,
    pub category_id: Option<CategoryId>,
    pub quantity: Option<Decimal>,
    pub priority: Option<Priority>,
    pub supplier_id: Option<PartyId>,
    pub currency: Option<CurrencyCode>,
    pub exchange_rate: Option<Decimal>,
    pub lead_time_days: Option<u32>,
    pub date_delivery: Option<NaiveDate>,
    pub initial_purchase_price: Option<Decimal>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_stop: Option<DateTime<Utc>>,
}

impl RequestRevision {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Command: ReviseRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviseRequest {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub revision: RequestRevision,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetMargin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMargin {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub margin: Margin,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkAggregated (`new → in_progress`).
///
/// Issued by the lifecycle controller after the grouping planner placed the
/// request on a purchase order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAggregated {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub purchase_line: PurchaseLineRef,
    pub counterparty: PartyId,
    pub currency: CurrencyCode,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ImportPurchasePrice.
///
/// `supplier_price` is the unit price currently on the linked purchase line;
/// `default_margin` is the product category's default, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPurchasePrice {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub supplier_price: Decimal,
    pub default_margin: Option<Margin>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Finalize (`in_progress → done`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finalize {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub completed_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Withdraw (toggle-off compensation, `new` only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdraw {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotationRequestCommand {
    CreateRequest(CreateRequest),
    ReviseRequest(ReviseRequest),
    SetMargin(SetMargin),
    MarkAggregated(MarkAggregated),
    ImportPurchasePrice(ImportPurchasePrice),
    Finalize(Finalize),
    Withdraw(Withdraw),
}

/// Event: RequestCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCreated {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub reference: String,
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    pub quantity: Decimal,
    pub priority: Priority,
    pub terms: PurchasingTerms,
    pub sales: SalesContext,
    pub period_start: Option<DateTime<Utc>>,
    pub period_stop: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestRevised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRevised {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub revision: RequestRevision,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MarginSet.
///
/// `final_purchase_price` is recomputed only once a price has been imported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginSet {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub margin: Margin,
    pub final_purchase_price: Option<Decimal>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SubmittedForPurchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedForPurchase {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub purchase_line: PurchaseLineRef,
    pub counterparty: PartyId,
    pub currency: CurrencyCode,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchasePriceImported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchasePriceImported {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub initial_purchase_price: Decimal,
    pub margin: Option<Margin>,
    pub margin_prefilled: bool,
    pub final_purchase_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestFinalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFinalized {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub final_purchase_price: Decimal,
    pub final_sale_value: Decimal,
    pub origin: Option<SalesLineRef>,
    pub completed_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestWithdrawn (tombstone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestWithdrawn {
    pub company_id: CompanyId,
    pub request_id: QuotationRequestId,
    pub origin: Option<SalesLineRef>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotationRequestEvent {
    RequestCreated(RequestCreated),
    RequestRevised(RequestRevised),
    MarginSet(MarginSet),
    SubmittedForPurchase(SubmittedForPurchase),
    PurchasePriceImported(PurchasePriceImported),
    RequestFinalized(RequestFinalized),
    RequestWithdrawn(RequestWithdrawn),
}

impl Event for QuotationRequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            QuotationRequestEvent::RequestCreated(_) => "quotation.request.created",
            QuotationRequestEvent::RequestRevised(_) => "quotation.request.revised",
            QuotationRequestEvent::MarginSet(_) => "quotation.request.margin_set",
            QuotationRequestEvent::SubmittedForPurchase(_) => {
                "quotation.request.submitted_for_purchase"
            }
            QuotationRequestEvent::PurchasePriceImported(_) => "quotation.request.price_imported",
            QuotationRequestEvent::RequestFinalized(_) => "quotation.request.finalized",
            QuotationRequestEvent::RequestWithdrawn(_) => "quotation.request.withdrawn",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            QuotationRequestEvent::RequestCreated(e) => e.occurred_at,
            QuotationRequestEvent::RequestRevised(e) => e.occurred_at,
            QuotationRequestEvent::MarginSet(e) => e.occurred_at,
            QuotationRequestEvent::SubmittedForPurchase(e) => e.occurred_at,
            QuotationRequestEvent::PurchasePriceImported(e) => e.occurred_at,
            QuotationRequestEvent::RequestFinalized(e) => e.occurred_at,
            QuotationRequestEvent::RequestWithdrawn(e) => e.occurred_at,
        }
    }
}

impl Aggregate for QuotationRequest {
    type Command = QuotationRequestCommand;
    type Event = QuotationRequestEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            QuotationRequestEvent::RequestCreated(e) => {
                self.id = e.request_id;
                self.company_id = Some(e.company_id);
                self.reference = e.reference.clone();
                self.stage = Stage::New;
                self.priority = e.priority;
                self.product_id = Some(e.product_id);
                self.category_id = e.category_id;
                self.quantity = e.quantity;
                self.terms = e.terms.clone();
                self.sales = e.sales.clone();
                self.final_purchase_price = None;
                self.final_sale_value = None;
                self.purchase_line = None;
                self.created_at = Some(e.occurred_at);
                self.period_start = e.period_start;
                self.period_stop = e.period_stop;
                self.completed_on = None;
                self.withdrawn = false;
                self.created = true;
            }
            QuotationRequestEvent::RequestRevised(e) => {
                let r = &e.revision;
                if let Some(v) = r.product_id {
                    self.product_id = Some(v);
                }
                if let Some(v) = r.category_id {
                    self.category_id = Some(v);
                }
                if let Some(v) = r.quantity {
                    self.quantity = v;
                }
                if let Some(v) = r.priority {
                    self.priority = v;
                }
                if let Some(v) = r.supplier_id {
                    self.terms.supplier_id = Some(v);
                }
                if let Some(v) = &r.currency {
                    self.terms.currency = Some(v.clone());
                }
                if let Some(v) = r.exchange_rate {
                    self.terms.exchange_rate = Some(v);
                }
                if let Some(v) = r.lead_time_days {
                    self.terms.lead_time_days = Some(v);
                }
                if let Some(v) = r.date_delivery {
                    self.terms.date_delivery = Some(v);
                }
                if let Some(v) = r.initial_purchase_price {
                    self.terms.initial_purchase_price = Some(v);
                }
                if let Some(v) = r.period_start {
                    self.period_start = Some(v);
                }
                if let Some(v) = r.period_stop {
                    self.period_stop = Some(v);
                }
            }
            QuotationRequestEvent::MarginSet(e) => {
                self.terms.margin = Some(e.margin);
                self.final_purchase_price = e.final_purchase_price;
            }
            QuotationRequestEvent::SubmittedForPurchase(e) => {
                self.purchase_line = Some(e.purchase_line);
                self.advance(Stage::InProgress);
            }
            QuotationRequestEvent::PurchasePriceImported(e) => {
                self.terms.initial_purchase_price = Some(e.initial_purchase_price);
                self.terms.margin = e.margin;
                self.final_purchase_price = Some(e.final_purchase_price);
            }
            QuotationRequestEvent::RequestFinalized(e) => {
                self.final_purchase_price = Some(e.final_purchase_price);
                self.final_sale_value = Some(e.final_sale_value);
                self.completed_on = Some(e.completed_on);
                self.advance(Stage::Done);
            }
            QuotationRequestEvent::RequestWithdrawn(_) => {
                self.withdrawn = true;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            QuotationRequestCommand::CreateRequest(cmd) => self.handle_create(cmd),
            QuotationRequestCommand::ReviseRequest(cmd) => self.handle_revise(cmd),
            QuotationRequestCommand::SetMargin(cmd) => self.handle_set_margin(cmd),
            QuotationRequestCommand::MarkAggregated(cmd) => self.handle_mark_aggregated(cmd),
            QuotationRequestCommand::ImportPurchasePrice(cmd) => self.handle_import(cmd),
            QuotationRequestCommand::Finalize(cmd) => self.handle_finalize(cmd),
            QuotationRequestCommand::Withdraw(cmd) => self.handle_withdraw(cmd),
        }
    }
}

fn validate_quantity(quantity: Decimal) -> Result<(), DomainError> {
    if quantity <= Decimal::ZERO {
        return Err(DomainError::validation("quantity must be positive"));
    }
    Ok(())
}

fn validate_price(price: Option<Decimal>) -> Result<(), DomainError> {
    if price.is_some_and(|p| p < Decimal::ZERO) {
        return Err(DomainError::validation(
            "initial purchase price must not be negative",
        ));
    }
    Ok(())
}

fn validate_exchange_rate(rate: Option<Decimal>) -> Result<(), DomainError> {
    if rate.is_some_and(|r| r <= Decimal::ZERO) {
        return Err(DomainError::validation("exchange rate must be positive"));
    }
    Ok(())
}

fn validate_period(
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
) -> Result<(), DomainError> {
    if let (Some(start), Some(stop)) = (start, stop) {
        if stop < start {
            return Err(DomainError::validation("period stop precedes period start"));
        }
    }
    Ok(())
}

impl QuotationRequest {
    fn ensure_company(&self, company_id: CompanyId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.company_id != Some(company_id) {
            return Err(DomainError::invariant("company mismatch"));
        }
        Ok(())
    }

    fn ensure_request_id(&self, request_id: QuotationRequestId) -> Result<(), DomainError> {
        if self.id != request_id {
            return Err(DomainError::invariant("request_id mismatch"));
        }
        Ok(())
    }

    /// Withdrawn requests behave as deleted.
    fn ensure_live(
        &self,
        company_id: CompanyId,
        request_id: QuotationRequestId,
    ) -> Result<(), DomainError> {
        if !self.created || self.withdrawn {
            return Err(DomainError::not_found());
        }
        self.ensure_company(company_id)?;
        self.ensure_request_id(request_id)
    }

    fn ensure_stage(&self, allowed: &[Stage], action: &str) -> Result<(), DomainError> {
        if allowed.contains(&self.stage) {
            return Ok(());
        }
        Err(DomainError::precondition(
            self.reference.clone(),
            format!("cannot {action} a request in stage '{}'", self.stage),
        ))
    }

    fn handle_create(
        &self,
        cmd: &CreateRequest,
    ) -> Result<Vec<QuotationRequestEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("quotation request already exists"));
        }
        self.ensure_request_id(cmd.request_id)?;

        if cmd.reference.trim().is_empty() {
            return Err(DomainError::validation("reference cannot be empty"));
        }
        validate_quantity(cmd.quantity)?;
        validate_price(cmd.terms.initial_purchase_price)?;
        validate_exchange_rate(cmd.terms.exchange_rate)?;
        validate_period(cmd.period_start, cmd.period_stop)?;

        Ok(vec![QuotationRequestEvent::RequestCreated(RequestCreated {
            company_id: cmd.company_id,
            request_id: cmd.request_id,
            reference: cmd.reference.trim().to_string(),
            product_id: cmd.product_id,
            category_id: cmd.category_id,
            quantity: cmd.quantity,
            priority: cmd.priority,
            terms: cmd.terms.clone(),
            sales: cmd.sales.clone(),
            period_start: cmd.period_start,
            period_stop: cmd.period_stop,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revise(
        &self,
        cmd: &ReviseRequest,
    ) -> Result<Vec<QuotationRequestEvent>, DomainError> {
        self.ensure_live(cmd.company_id, cmd.request_id)?;
        self.ensure_stage(&[Stage::New], "revise")?;

        let r = &cmd.revision;
        if r.is_empty() {
            return Ok(vec![]);
        }
        if let Some(quantity) = r.quantity {
            validate_quantity(quantity)?;
        }
        validate_price(r.initial_purchase_price)?;
        validate_exchange_rate(r.exchange_rate)?;
        validate_period(
            r.period_start.or(self.period_start),
            r.period_stop.or(self.period_stop),
        )?;

        Ok(vec![QuotationRequestEvent::RequestRevised(RequestRevised {
            company_id: cmd.company_id,
            request_id: cmd.request_id,
            revision: r.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_margin(
        &self,
        cmd: &SetMargin,
    ) -> Result<Vec<QuotationRequestEvent>, DomainError> {
        self.ensure_live(cmd.company_id, cmd.request_id)?;
        self.ensure_stage(&[Stage::New, Stage::InProgress], "set the margin of")?;

        if self.terms.margin == Some(cmd.margin) {
            return Ok(vec![]);
        }

        // Only a priced request carries a final purchase price.
        let final_purchase_price = match self.final_purchase_price {
            Some(_) => {
                pricing::final_purchase_price(self.terms.initial_purchase_price, Some(cmd.margin))?
            }
            None => None,
        };

        Ok(vec![QuotationRequestEvent::MarginSet(MarginSet {
            company_id: cmd.company_id,
            request_id: cmd.request_id,
            margin: cmd.margin,
            final_purchase_price,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_aggregated(
        &self,
        cmd: &MarkAggregated,
    ) -> Result<Vec<QuotationRequestEvent>, DomainError> {
        self.ensure_live(cmd.company_id, cmd.request_id)?;
        self.ensure_stage(&[Stage::New], "submit for purchase")?;

        if self.purchase_line.is_some() {
            return Err(DomainError::invariant(format!(
                "request '{}' is already linked to a purchase line",
                self.reference
            )));
        }

        Ok(vec![QuotationRequestEvent::SubmittedForPurchase(
            SubmittedForPurchase {
                company_id: cmd.company_id,
                request_id: cmd.request_id,
                purchase_line: cmd.purchase_line,
                counterparty: cmd.counterparty,
                currency: cmd.currency.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    /// Skipped silently (no events) outside `in_progress` or for a
    /// non-positive supplier price.
    fn handle_import(
        &self,
        cmd: &ImportPurchasePrice,
    ) -> Result<Vec<QuotationRequestEvent>, DomainError> {
        self.ensure_live(cmd.company_id, cmd.request_id)?;

        if self.stage != Stage::InProgress || !pricing::accepts_supplier_price(cmd.supplier_price) {
            return Ok(vec![]);
        }

        let margin_prefilled = self.terms.margin.is_none() && cmd.default_margin.is_some();
        let margin = self.terms.margin.or(cmd.default_margin);
        let final_purchase_price =
            pricing::final_purchase_price(Some(cmd.supplier_price), margin)?
                .unwrap_or(cmd.supplier_price);

        let unchanged = self.terms.initial_purchase_price == Some(cmd.supplier_price)
            && self.terms.margin == margin
            && self.final_purchase_price == Some(final_purchase_price);
        if unchanged {
            return Ok(vec![]);
        }

        Ok(vec![QuotationRequestEvent::PurchasePriceImported(
            PurchasePriceImported {
                company_id: cmd.company_id,
                request_id: cmd.request_id,
                initial_purchase_price: cmd.supplier_price,
                margin,
                margin_prefilled,
                final_purchase_price,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_finalize(&self, cmd: &Finalize) -> Result<Vec<QuotationRequestEvent>, DomainError> {
        self.ensure_live(cmd.company_id, cmd.request_id)?;
        self.ensure_stage(&[Stage::InProgress], "finalize")?;

        let Some(margin) = self.terms.margin else {
            return Err(DomainError::precondition(
                self.reference.clone(),
                "margin is not set",
            ));
        };

        // An unpriced request finalizes at zero.
        let initial = self.terms.initial_purchase_price.unwrap_or(Decimal::ZERO);
        let final_purchase_price =
            pricing::final_purchase_price(Some(initial), Some(margin))?.unwrap_or(initial);

        Ok(vec![QuotationRequestEvent::RequestFinalized(RequestFinalized {
            company_id: cmd.company_id,
            request_id: cmd.request_id,
            final_purchase_price,
            final_sale_value: pricing::final_sale_value(final_purchase_price),
            origin: self.sales.origin,
            completed_on: cmd.completed_on,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_withdraw(&self, cmd: &Withdraw) -> Result<Vec<QuotationRequestEvent>, DomainError> {
        self.ensure_live(cmd.company_id, cmd.request_id)?;
        self.ensure_stage(&[Stage::New], "withdraw")?;

        Ok(vec![QuotationRequestEvent::RequestWithdrawn(RequestWithdrawn {
            company_id: cmd.company_id,
            request_id: cmd.request_id,
            origin: self.sales.origin,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quoteflow_events::execute;
    use quoteflow_purchasing::PurchaseOrderId;
    use rust_decimal_macros::dec;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn today() -> NaiveDate {
        test_time().date_naive()
    }

    fn margin(value: Decimal) -> Margin {
        Margin::new(value).unwrap()
    }

    fn new_request(company_id: CompanyId, terms: PurchasingTerms) -> QuotationRequest {
        let request_id = QuotationRequestId::new(AggregateId::new());
        let mut request = QuotationRequest::empty(request_id);
        execute(
            &mut request,
            &QuotationRequestCommand::CreateRequest(CreateRequest {
                company_id,
                request_id,
                reference: "RFQ/00001".to_string(),
                product_id: ProductId::new(),
                category_id: None,
                quantity: dec!(3),
                priority: Priority::Normal,
                terms,
                sales: SalesContext::default(),
                period_start: None,
                period_stop: None,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        request
    }

    fn aggregate_cmd(request: &QuotationRequest, company_id: CompanyId) -> QuotationRequestCommand {
        QuotationRequestCommand::MarkAggregated(MarkAggregated {
            company_id,
            request_id: request.id_typed(),
            purchase_line: PurchaseLineRef {
                order_id: PurchaseOrderId::new(AggregateId::new()),
                line_no: 1,
            },
            counterparty: PartyId::new(),
            currency: CurrencyCode::parse("EUR").unwrap(),
            occurred_at: test_time(),
        })
    }

    fn import_cmd(
        request: &QuotationRequest,
        company_id: CompanyId,
        supplier_price: Decimal,
        default_margin: Option<Margin>,
    ) -> QuotationRequestCommand {
        QuotationRequestCommand::ImportPurchasePrice(ImportPurchasePrice {
            company_id,
            request_id: request.id_typed(),
            supplier_price,
            default_margin,
            occurred_at: test_time(),
        })
    }

    fn margin_cmd(
        request: &QuotationRequest,
        company_id: CompanyId,
        value: Decimal,
    ) -> QuotationRequestCommand {
        QuotationRequestCommand::SetMargin(SetMargin {
            company_id,
            request_id: request.id_typed(),
            margin: margin(value),
            occurred_at: test_time(),
        })
    }

    fn finalize_cmd(request: &QuotationRequest, company_id: CompanyId) -> QuotationRequestCommand {
        QuotationRequestCommand::Finalize(Finalize {
            company_id,
            request_id: request.id_typed(),
            completed_on: today(),
            occurred_at: test_time(),
        })
    }

    fn in_progress_request(company_id: CompanyId) -> QuotationRequest {
        let mut request = new_request(company_id, PurchasingTerms::default());
        let cmd = aggregate_cmd(&request, company_id);
        execute(&mut request, &cmd).unwrap();
        request
    }

    #[test]
    fn created_request_starts_new_and_unpriced() {
        let request = new_request(CompanyId::new(), PurchasingTerms::default());
        assert_eq!(request.stage(), Stage::New);
        assert_eq!(request.reference(), "RFQ/00001");
        assert_eq!(request.final_purchase_price(), None);
        assert_eq!(request.purchase_line(), None);
        assert_eq!(request.version(), 1);
    }

    #[test]
    fn create_rejects_non_positive_quantity() {
        let request_id = QuotationRequestId::new(AggregateId::new());
        let request = QuotationRequest::empty(request_id);
        let err = request
            .handle(&QuotationRequestCommand::CreateRequest(CreateRequest {
                company_id: CompanyId::new(),
                request_id,
                reference: "RFQ/00002".to_string(),
                product_id: ProductId::new(),
                category_id: None,
                quantity: dec!(0),
                priority: Priority::Urgent,
                terms: PurchasingTerms::default(),
                sales: SalesContext::default(),
                period_start: None,
                period_stop: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn aggregation_links_purchase_line_and_advances_stage() {
        let company_id = CompanyId::new();
        let request = in_progress_request(company_id);
        assert_eq!(request.stage(), Stage::InProgress);
        assert!(request.purchase_line().is_some());

        let err = request.handle(&aggregate_cmd(&request, company_id)).unwrap_err();
        assert!(matches!(
            err,
            DomainError::Precondition { ref reference, .. } if reference == "RFQ/00001"
        ));
    }

    #[test]
    fn import_ignores_zero_price_and_accepts_positive_price() {
        let company_id = CompanyId::new();
        let mut request = in_progress_request(company_id);

        let skipped = request.handle(&import_cmd(&request, company_id, dec!(0), None)).unwrap();
        assert!(skipped.is_empty());
        assert_eq!(request.initial_purchase_price(), None);

        let cmd = import_cmd(&request, company_id, dec!(50), None);
        execute(&mut request, &cmd).unwrap();
        assert_eq!(request.initial_purchase_price(), Some(dec!(50)));
        assert_eq!(request.final_purchase_price(), Some(dec!(50)));

        // Re-importing the same price records nothing new.
        let again = request.handle(&import_cmd(&request, company_id, dec!(50), None)).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn import_is_skipped_for_new_requests() {
        let company_id = CompanyId::new();
        let request = new_request(company_id, PurchasingTerms::default());
        let events = request.handle(&import_cmd(&request, company_id, dec!(50), None)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn import_prefills_category_margin_only_when_unset() {
        let company_id = CompanyId::new();
        let mut request = in_progress_request(company_id);

        let cmd = import_cmd(&request, company_id, dec!(100), Some(margin(dec!(1.2))));
        let events = execute(&mut request, &cmd).unwrap();
        match &events[0] {
            QuotationRequestEvent::PurchasePriceImported(e) => {
                assert!(e.margin_prefilled);
                assert_eq!(e.final_purchase_price, dec!(120.0));
            }
            other => panic!("Expected PurchasePriceImported, got {other:?}"),
        }

        let cmd = margin_cmd(&request, company_id, dec!(1.5));
        execute(&mut request, &cmd).unwrap();
        let cmd = import_cmd(&request, company_id, dec!(100), Some(margin(dec!(1.2))));
        execute(&mut request, &cmd).unwrap();
        assert_eq!(request.margin(), Some(margin(dec!(1.5))));
        assert_eq!(request.final_purchase_price(), Some(dec!(150.0)));
    }

    #[test]
    fn setting_margin_before_import_keeps_request_unpriced() {
        let company_id = CompanyId::new();
        let mut request = new_request(
            company_id,
            PurchasingTerms {
                initial_purchase_price: Some(dec!(10)),
                ..PurchasingTerms::default()
            },
        );
        let cmd = margin_cmd(&request, company_id, dec!(1.3));
        execute(&mut request, &cmd).unwrap();
        assert_eq!(request.margin(), Some(margin(dec!(1.3))));
        assert_eq!(request.final_purchase_price(), None);
    }

    #[test]
    fn finalize_without_margin_fails_and_keeps_stage() {
        let company_id = CompanyId::new();
        let mut request = in_progress_request(company_id);
        let cmd = import_cmd(&request, company_id, dec!(50), None);
        execute(&mut request, &cmd).unwrap();

        let err = request.handle(&finalize_cmd(&request, company_id)).unwrap_err();
        assert!(matches!(err, DomainError::Precondition { .. }));
        assert_eq!(request.stage(), Stage::InProgress);
    }

    #[test]
    fn finalize_computes_sale_value_and_closes_request() {
        let company_id = CompanyId::new();
        let mut request = in_progress_request(company_id);
        let cmd = import_cmd(&request, company_id, dec!(50), None);
        execute(&mut request, &cmd).unwrap();
        let cmd = margin_cmd(&request, company_id, dec!(1.1));
        execute(&mut request, &cmd).unwrap();
        assert_eq!(request.final_purchase_price(), Some(dec!(55.0)));

        let cmd = finalize_cmd(&request, company_id);
        execute(&mut request, &cmd).unwrap();
        assert_eq!(request.stage(), Stage::Done);
        assert_eq!(request.final_sale_value(), Some(dec!(55.0)));
        assert_eq!(request.completed_on(), Some(today()));

        // Done is read-only.
        let err = request.handle(&margin_cmd(&request, company_id, dec!(2))).unwrap_err();
        assert!(matches!(err, DomainError::Precondition { .. }));
        assert!(request.handle(&finalize_cmd(&request, company_id)).is_err());
    }

    #[test]
    fn out_of_range_prices_are_rejected_without_events() {
        let company_id = CompanyId::new();
        let huge = Decimal::MAX / dec!(2);

        let mut request = in_progress_request(company_id);
        let err = request
            .handle(&import_cmd(&request, company_id, huge, Some(margin(dec!(3)))))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(request.initial_purchase_price(), None);

        // A price that fits on its own overflows once a large margin is set.
        let cmd = import_cmd(&request, company_id, huge, None);
        execute(&mut request, &cmd).unwrap();
        let err = request.handle(&margin_cmd(&request, company_id, dec!(3))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(request.margin(), None);
        assert_eq!(request.final_purchase_price(), Some(huge));
    }

    #[test]
    fn finalize_rejects_an_out_of_range_sale_value() {
        let company_id = CompanyId::new();
        let huge = Decimal::MAX / dec!(2);
        let mut request = new_request(
            company_id,
            PurchasingTerms {
                initial_purchase_price: Some(huge),
                margin: Some(margin(dec!(3))),
                ..PurchasingTerms::default()
            },
        );
        let cmd = aggregate_cmd(&request, company_id);
        execute(&mut request, &cmd).unwrap();

        let err = request.handle(&finalize_cmd(&request, company_id)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(request.stage(), Stage::InProgress);
    }

    #[test]
    fn revise_is_only_allowed_while_new() {
        let company_id = CompanyId::new();
        let mut request = new_request(company_id, PurchasingTerms::default());
        let supplier = PartyId::new();

        let revise = |request: &QuotationRequest| {
            QuotationRequestCommand::ReviseRequest(ReviseRequest {
                company_id,
                request_id: request.id_typed(),
                revision: RequestRevision {
                    supplier_id: Some(supplier),
                    quantity: Some(dec!(7)),
                    ..RequestRevision::default()
                },
                occurred_at: test_time(),
            })
        };

        let cmd = revise(&request);
        execute(&mut request, &cmd).unwrap();
        assert_eq!(request.supplier_id(), Some(supplier));
        assert_eq!(request.quantity(), dec!(7));

        let cmd = aggregate_cmd(&request, company_id);
        execute(&mut request, &cmd).unwrap();
        assert!(matches!(
            request.handle(&revise(&request)).unwrap_err(),
            DomainError::Precondition { .. }
        ));
    }

    #[test]
    fn withdrawn_request_behaves_as_deleted() {
        let company_id = CompanyId::new();
        let mut request = new_request(company_id, PurchasingTerms::default());
        let cmd = QuotationRequestCommand::Withdraw(Withdraw {
            company_id,
            request_id: request.id_typed(),
            occurred_at: test_time(),
        });
        execute(&mut request, &cmd).unwrap();

        assert!(request.is_withdrawn());
        assert!(!request.is_open());
        assert_eq!(
            request.handle(&aggregate_cmd(&request, company_id)).unwrap_err(),
            DomainError::NotFound
        );
    }

    #[test]
    fn withdraw_is_refused_once_in_progress() {
        let company_id = CompanyId::new();
        let request = in_progress_request(company_id);
        let err = request
            .handle(&QuotationRequestCommand::Withdraw(Withdraw {
                company_id,
                request_id: request.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Precondition { .. }));
    }

    #[test]
    fn commands_from_another_company_are_rejected() {
        let company_id = CompanyId::new();
        let request = new_request(company_id, PurchasingTerms::default());
        let err = request
            .handle(&margin_cmd(&request, CompanyId::new(), dec!(1.2)))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Aggregate,
        Import(i64),
        SetMargin(i64),
        Finalize,
        Withdraw,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Aggregate),
            (0i64..10_000).prop_map(Step::Import),
            (1i64..30_000).prop_map(Step::SetMargin),
            Just(Step::Finalize),
            Just(Step::Withdraw),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: whatever is attempted, the stage never moves backward and
        /// a done request records no further events.
        #[test]
        fn stage_only_moves_forward(steps in prop::collection::vec(step_strategy(), 1..24)) {
            let company_id = CompanyId::new();
            let mut request = new_request(company_id, PurchasingTerms::default());

            for step in steps {
                let before = request.stage();
                let cmd = match step {
                    Step::Aggregate => aggregate_cmd(&request, company_id),
                    Step::Import(cents) => {
                        import_cmd(&request, company_id, Decimal::new(cents, 2), None)
                    }
                    Step::SetMargin(bp) => margin_cmd(&request, company_id, Decimal::new(bp, 4)),
                    Step::Finalize => finalize_cmd(&request, company_id),
                    Step::Withdraw => QuotationRequestCommand::Withdraw(Withdraw {
                        company_id,
                        request_id: request.id_typed(),
                        occurred_at: test_time(),
                    }),
                };

                let outcome = execute(&mut request, &cmd);
                if before == Stage::Done {
                    prop_assert!(outcome.map(|events| events.is_empty()).unwrap_or(true));
                }
                prop_assert!(request.stage() >= before);
                prop_assert!(
                    request.final_purchase_price().is_none() || request.stage() != Stage::New
                );
            }
        }
    }
}
