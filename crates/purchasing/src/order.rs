use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use quoteflow_core::{
    Aggregate, AggregateId, AggregateRoot, CompanyId, CurrencyCode, DomainError, PartyId,
    ProductId,
};
use quoteflow_events::Event;

/// Stream type of the purchase order aggregate.
pub const AGGREGATE_TYPE: &str = "purchasing.order";

/// Purchase order identifier (company-scoped via `company_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PurchaseOrderId(pub AggregateId);

impl PurchaseOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PurchaseOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Address of a purchase order line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PurchaseLineRef {
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
}

/// Purchase order line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Decimal,
    /// Seeded from the request, later overwritten by the supplier's quote.
    pub unit_price: Decimal,
    pub description: String,
}

/// Aggregate root: PurchaseOrder (a request for quotation sent to a counterparty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    company_id: Option<CompanyId>,
    counterparty: Option<PartyId>,
    currency: Option<CurrencyCode>,
    date_planned: Option<DateTime<Utc>>,
    lines: Vec<PurchaseLine>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            company_id: None,
            counterparty: None,
            currency: None,
            date_planned: None,
            lines: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn company_id(&self) -> Option<CompanyId> {
        self.company_id
    }

    pub fn counterparty(&self) -> Option<PartyId> {
        self.counterparty
    }

    pub fn currency(&self) -> Option<&CurrencyCode> {
        self.currency.as_ref()
    }

    pub fn date_planned(&self) -> Option<DateTime<Utc>> {
        self.date_planned
    }

    pub fn lines(&self) -> &[PurchaseLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&PurchaseLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub company_id: CompanyId,
    pub order_id: PurchaseOrderId,
    pub counterparty: PartyId,
    pub currency: CurrencyCode,
    pub date_planned: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub company_id: CompanyId,
    pub order_id: PurchaseOrderId,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordSupplierQuote (the purchasing actor enters the returned price).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSupplierQuote {
    pub company_id: CompanyId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub unit_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    AddLine(AddLine),
    RecordSupplierQuote(RecordSupplierQuote),
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub company_id: CompanyId,
    pub order_id: PurchaseOrderId,
    pub counterparty: PartyId,
    pub currency: CurrencyCode,
    pub date_planned: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderLineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLineAdded {
    pub company_id: CompanyId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

impl PurchaseOrderLineAdded {
    pub fn line(&self) -> PurchaseLineRef {
        PurchaseLineRef {
            order_id: self.order_id,
            line_no: self.line_no,
        }
    }
}

/// Event: SupplierQuoteRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierQuoteRecorded {
    pub company_id: CompanyId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub unit_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseOrderLineAdded(PurchaseOrderLineAdded),
    SupplierQuoteRecorded(SupplierQuoteRecorded),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::PurchaseOrderLineAdded(_) => "purchasing.order.line_added",
            PurchaseOrderEvent::SupplierQuoteRecorded(_) => "purchasing.order.quote_recorded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => e.occurred_at,
            PurchaseOrderEvent::SupplierQuoteRecorded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.company_id = Some(e.company_id);
                self.counterparty = Some(e.counterparty);
                self.currency = Some(e.currency.clone());
                self.date_planned = e.date_planned;
                self.lines.clear();
                self.created = true;
            }
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => {
                self.lines.push(PurchaseLine {
                    line_no: e.line_no,
                    product_id: e.product_id,
                    quantity: e.quantity,
                    unit_price: e.unit_price,
                    description: e.description.clone(),
                });
            }
            PurchaseOrderEvent::SupplierQuoteRecorded(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == e.line_no) {
                    line.unit_price = e.unit_price;
                }
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::RecordSupplierQuote(cmd) => self.handle_record_quote(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_company(&self, company_id: CompanyId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.company_id != Some(company_id) {
            return Err(DomainError::invariant("company mismatch"));
        }
        Ok(())
    }

    fn ensure_order_id(&self, order_id: PurchaseOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(
        &self,
        cmd: &CreatePurchaseOrder,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCreated(
            PurchaseOrderCreated {
                company_id: cmd.company_id,
                order_id: cmd.order_id,
                counterparty: cmd.counterparty,
                currency: cmd.currency.clone(),
                date_planned: cmd.date_planned,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_company(cmd.company_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if cmd.quantity <= Decimal::ZERO {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if cmd.unit_price.is_sign_negative() {
            return Err(DomainError::validation("unit_price must not be negative"));
        }

        let next_line_no = (self.lines.len() as u32) + 1;
        Ok(vec![PurchaseOrderEvent::PurchaseOrderLineAdded(
            PurchaseOrderLineAdded {
                company_id: cmd.company_id,
                order_id: cmd.order_id,
                line_no: next_line_no,
                product_id: cmd.product_id,
                quantity: cmd.quantity,
                unit_price: cmd.unit_price,
                description: cmd.description.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_record_quote(
        &self,
        cmd: &RecordSupplierQuote,
    ) -> Result<Vec<PurchaseOrderEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_company(cmd.company_id)?;
        self.ensure_order_id(cmd.order_id)?;

        if self.line(cmd.line_no).is_none() {
            return Err(DomainError::validation(format!(
                "purchase line {} does not exist",
                cmd.line_no
            )));
        }

        // Zero is accepted here: it is how a supplier says "not quoted yet".
        if cmd.unit_price.is_sign_negative() {
            return Err(DomainError::validation("unit_price must not be negative"));
        }

        Ok(vec![PurchaseOrderEvent::SupplierQuoteRecorded(
            SupplierQuoteRecorded {
                company_id: cmd.company_id,
                order_id: cmd.order_id,
                line_no: cmd.line_no,
                unit_price: cmd.unit_price,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}
