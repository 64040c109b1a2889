use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use quoteflow_core::{
    Aggregate, AggregateId, AggregateRoot, CategoryId, CompanyId, CurrencyCode, DomainError,
    PartyId, PricelistId, ProductId, UserId,
};
use quoteflow_events::Event;

/// Stream type of the sales order aggregate.
pub const AGGREGATE_TYPE: &str = "sales.order";

/// Sales order identifier (company-scoped via `company_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SalesOrderId(pub AggregateId);

impl SalesOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for SalesOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Address of a single sales line: the document plus the line number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SalesLineRef {
    pub order_id: SalesOrderId,
    pub line_no: u32,
}

impl core::fmt::Display for SalesLineRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}#{}", self.order_id, self.line_no)
    }
}

/// Sales line: product, quantity, unit price and the quotation toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// "Request a purchase quotation for this line".
    pub quote_requested: bool,
    /// Opaque link to the quotation request aggregate created for this line.
    pub quotation_request: Option<AggregateId>,
}

impl SalesLine {
    /// `quantity × unit_price`; a validation error when it leaves the decimal range.
    pub fn subtotal(&self) -> Result<Decimal, DomainError> {
        self.quantity.checked_mul(self.unit_price).ok_or_else(|| {
            DomainError::validation(format!(
                "subtotal of line {} is out of range ({} x {})",
                self.line_no, self.quantity, self.unit_price
            ))
        })
    }
}

/// Aggregate root: SalesOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalesOrder {
    id: SalesOrderId,
    company_id: Option<CompanyId>,
    customer_id: Option<PartyId>,
    pricelist_id: Option<PricelistId>,
    currency: Option<CurrencyCode>,
    salesperson: Option<UserId>,
    lines: Vec<SalesLine>,
    version: u64,
    created: bool,
}

impl SalesOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: SalesOrderId) -> Self {
        Self {
            id,
            company_id: None,
            customer_id: None,
            pricelist_id: None,
            currency: None,
            salesperson: None,
            lines: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SalesOrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn company_id(&self) -> Option<CompanyId> {
        self.company_id
    }

    pub fn customer_id(&self) -> Option<PartyId> {
        self.customer_id
    }

    pub fn pricelist_id(&self) -> Option<PricelistId> {
        self.pricelist_id
    }

    pub fn currency(&self) -> Option<&CurrencyCode> {
        self.currency.as_ref()
    }

    pub fn salesperson(&self) -> Option<UserId> {
        self.salesperson
    }

    pub fn lines(&self) -> &[SalesLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&SalesLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    fn line_mut(&mut self, line_no: u32) -> Option<&mut SalesLine> {
        self.lines.iter_mut().find(|l| l.line_no == line_no)
    }
}

impl AggregateRoot for SalesOrder {
    type Id = SalesOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateSalesOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSalesOrder {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub customer_id: PartyId,
    pub pricelist_id: Option<PricelistId>,
    pub currency: CurrencyCode,
    pub salesperson: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine. A line may be created with the quotation toggle already on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub quote_requested: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetQuoteRequested (the line toggle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetQuoteRequested {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub enabled: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LinkQuotationRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkQuotationRequest {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub request_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UnlinkQuotationRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkQuotationRequest {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub request_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyQuotedPrice (write-back of the computed sale value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyQuotedPrice {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub unit_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SalesOrderCommand {
    CreateSalesOrder(CreateSalesOrder),
    AddLine(AddLine),
    SetQuoteRequested(SetQuoteRequested),
    LinkQuotationRequest(LinkQuotationRequest),
    UnlinkQuotationRequest(UnlinkQuotationRequest),
    ApplyQuotedPrice(ApplyQuotedPrice),
}

/// Event: SalesOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalesOrderCreated {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub customer_id: PartyId,
    pub pricelist_id: Option<PricelistId>,
    pub currency: CurrencyCode,
    pub salesperson: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAdded {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestToggled.
///
/// Emitted on every accepted toggle write, including the implicit one when a
/// line is created with the toggle on. Consumed by the sale-line sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestToggled {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub enabled: bool,
    pub occurred_at: DateTime<Utc>,
}

impl RequestToggled {
    pub fn line(&self) -> SalesLineRef {
        SalesLineRef {
            order_id: self.order_id,
            line_no: self.line_no,
        }
    }
}

/// Event: QuotationRequestLinked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotationRequestLinked {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub request_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: QuotationRequestUnlinked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotationRequestUnlinked {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub request_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineUnitPriceUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineUnitPriceUpdated {
    pub company_id: CompanyId,
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub previous_unit_price: Decimal,
    pub unit_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SalesOrderEvent {
    SalesOrderCreated(SalesOrderCreated),
    LineAdded(LineAdded),
    RequestToggled(RequestToggled),
    QuotationRequestLinked(QuotationRequestLinked),
    QuotationRequestUnlinked(QuotationRequestUnlinked),
    LineUnitPriceUpdated(LineUnitPriceUpdated),
}

impl Event for SalesOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SalesOrderEvent::SalesOrderCreated(_) => "sales.order.created",
            SalesOrderEvent::LineAdded(_) => "sales.order.line_added",
            SalesOrderEvent::RequestToggled(_) => "sales.order.quote_request_toggled",
            SalesOrderEvent::QuotationRequestLinked(_) => "sales.order.quote_request_linked",
            SalesOrderEvent::QuotationRequestUnlinked(_) => "sales.order.quote_request_unlinked",
            SalesOrderEvent::LineUnitPriceUpdated(_) => "sales.order.line_price_updated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SalesOrderEvent::SalesOrderCreated(e) => e.occurred_at,
            SalesOrderEvent::LineAdded(e) => e.occurred_at,
            SalesOrderEvent::RequestToggled(e) => e.occurred_at,
            SalesOrderEvent::QuotationRequestLinked(e) => e.occurred_at,
            SalesOrderEvent::QuotationRequestUnlinked(e) => e.occurred_at,
            SalesOrderEvent::LineUnitPriceUpdated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SalesOrder {
    type Command = SalesOrderCommand;
    type Event = SalesOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SalesOrderEvent::SalesOrderCreated(e) => {
                self.id = e.order_id;
                self.company_id = Some(e.company_id);
                self.customer_id = Some(e.customer_id);
                self.pricelist_id = e.pricelist_id;
                self.currency = Some(e.currency.clone());
                self.salesperson = e.salesperson;
                self.lines.clear();
                self.created = true;
            }
            SalesOrderEvent::LineAdded(e) => {
                self.lines.push(SalesLine {
                    line_no: e.line_no,
                    product_id: e.product_id,
                    category_id: e.category_id,
                    quantity: e.quantity,
                    unit_price: e.unit_price,
                    quote_requested: false,
                    quotation_request: None,
                });
            }
            SalesOrderEvent::RequestToggled(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.quote_requested = e.enabled;
                }
            }
            SalesOrderEvent::QuotationRequestLinked(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.quotation_request = Some(e.request_id);
                }
            }
            SalesOrderEvent::QuotationRequestUnlinked(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.quotation_request = None;
                }
            }
            SalesOrderEvent::LineUnitPriceUpdated(e) => {
                if let Some(line) = self.line_mut(e.line_no) {
                    line.unit_price = e.unit_price;
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SalesOrderCommand::CreateSalesOrder(cmd) => self.handle_create(cmd),
            SalesOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            SalesOrderCommand::SetQuoteRequested(cmd) => self.handle_toggle(cmd),
            SalesOrderCommand::LinkQuotationRequest(cmd) => self.handle_link(cmd),
            SalesOrderCommand::UnlinkQuotationRequest(cmd) => self.handle_unlink(cmd),
            SalesOrderCommand::ApplyQuotedPrice(cmd) => self.handle_apply_price(cmd),
        }
    }
}

impl SalesOrder {
    fn ensure_company(&self, company_id: CompanyId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.company_id != Some(company_id) {
            return Err(DomainError::invariant("company mismatch"));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: SalesOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_existing(
        &self,
        company_id: CompanyId,
        order_id: SalesOrderId,
    ) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_company(company_id)?;
        self.ensure_order_id(order_id)
    }

    fn existing_line(&self, line_no: u32) -> Result<&SalesLine, DomainError> {
        self.line(line_no)
            .ok_or_else(|| DomainError::validation(format!("sales line {line_no} does not exist")))
    }

    fn handle_create(&self, cmd: &CreateSalesOrder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("sales order already exists"));
        }

        Ok(vec![SalesOrderEvent::SalesOrderCreated(SalesOrderCreated {
            company_id: cmd.company_id,
            order_id: cmd.order_id,
            customer_id: cmd.customer_id,
            pricelist_id: cmd.pricelist_id,
            currency: cmd.currency.clone(),
            salesperson: cmd.salesperson,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_existing(cmd.company_id, cmd.order_id)?;

        if cmd.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.unit_price.is_sign_negative() {
            return Err(DomainError::validation("unit_price must not be negative"));
        }

        let next_line_no = self.lines.iter().map(|l| l.line_no).max().unwrap_or(0) + 1;

        let mut events = vec![SalesOrderEvent::LineAdded(LineAdded {
            company_id: cmd.company_id,
            order_id: cmd.order_id,
            line_no: next_line_no,
            product_id: cmd.product_id,
            category_id: cmd.category_id,
            quantity: cmd.quantity,
            unit_price: cmd.unit_price,
            occurred_at: cmd.occurred_at,
        })];

        if cmd.quote_requested {
            events.push(SalesOrderEvent::RequestToggled(RequestToggled {
                company_id: cmd.company_id,
                order_id: cmd.order_id,
                line_no: next_line_no,
                enabled: true,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_toggle(&self, cmd: &SetQuoteRequested) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_existing(cmd.company_id, cmd.order_id)?;
        self.existing_line(cmd.line_no)?;

        Ok(vec![SalesOrderEvent::RequestToggled(RequestToggled {
            company_id: cmd.company_id,
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            enabled: cmd.enabled,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_link(&self, cmd: &LinkQuotationRequest) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_existing(cmd.company_id, cmd.order_id)?;
        let line = self.existing_line(cmd.line_no)?;

        match line.quotation_request {
            Some(existing) if existing == cmd.request_id => Ok(vec![]),
            Some(existing) => Err(DomainError::duplicate_link(
                SalesLineRef {
                    order_id: cmd.order_id,
                    line_no: cmd.line_no,
                }
                .to_string(),
                format!("line is already linked to request {existing}"),
            )),
            None => Ok(vec![SalesOrderEvent::QuotationRequestLinked(
                QuotationRequestLinked {
                    company_id: cmd.company_id,
                    order_id: cmd.order_id,
                    line_no: cmd.line_no,
                    request_id: cmd.request_id,
                    occurred_at: cmd.occurred_at,
                },
            )]),
        }
    }

    fn handle_unlink(
        &self,
        cmd: &UnlinkQuotationRequest,
    ) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_existing(cmd.company_id, cmd.order_id)?;
        let line = self.existing_line(cmd.line_no)?;

        if line.quotation_request != Some(cmd.request_id) {
            return Ok(vec![]);
        }

        Ok(vec![SalesOrderEvent::QuotationRequestUnlinked(
            QuotationRequestUnlinked {
                company_id: cmd.company_id,
                order_id: cmd.order_id,
                line_no: cmd.line_no,
                request_id: cmd.request_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_apply_price(
        &self,
        cmd: &ApplyQuotedPrice,
    ) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_existing(cmd.company_id, cmd.order_id)?;
        let line = self.existing_line(cmd.line_no)?;

        if cmd.unit_price.is_sign_negative() {
            return Err(DomainError::validation("unit_price must not be negative"));
        }

        Ok(vec![SalesOrderEvent::LineUnitPriceUpdated(LineUnitPriceUpdated {
            company_id: cmd.company_id,
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            previous_unit_price: line.unit_price,
            unit_price: cmd.unit_price,
            occurred_at: cmd.occurred_at,
        })])
    }
}
