#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use quoteflow_core::{CategoryId, CompanyId, CurrencyCode, PartyId, ProductId, UserId};
use quoteflow_events::{EventEnvelope, InMemoryEventBus};
use quoteflow_infra::command_dispatcher::CommandDispatcher;
use quoteflow_infra::event_store::InMemoryEventStore;
use quoteflow_infra::{
    InMemoryCategoryMargins, InMemoryReferenceAllocator, LifecycleController, NewSalesLine,
    NewSalesOrder, OperationContext, ToggleOutcome, WorkflowConfig,
};
use quoteflow_quotation::Margin;
use quoteflow_sales::{SalesLineRef, SalesOrderId};

pub type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type Controller = LifecycleController<Arc<InMemoryEventStore>, Bus>;

pub struct Harness {
    pub controller: Controller,
    pub store: Arc<InMemoryEventStore>,
    pub margins: Arc<InMemoryCategoryMargins>,
    pub ctx: OperationContext,
}

pub fn usd() -> CurrencyCode {
    CurrencyCode::parse("USD").unwrap()
}

pub fn eur() -> CurrencyCode {
    CurrencyCode::parse("EUR").unwrap()
}

pub fn margin(value: Decimal) -> Margin {
    Margin::new(value).unwrap()
}

pub fn harness() -> Harness {
    harness_with(WorkflowConfig::default())
}

pub fn harness_with(config: WorkflowConfig) -> Harness {
    let store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let margins = Arc::new(InMemoryCategoryMargins::new());
    let references = Arc::new(InMemoryReferenceAllocator::from_config(&config));

    let controller = LifecycleController::new(
        CommandDispatcher::new(store.clone(), bus),
        config,
        references,
        margins.clone(),
    );

    let ctx = OperationContext::new(CompanyId::new(), UserId::new(), usd(), PartyId::new())
        .at(Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap());

    Harness {
        controller,
        store,
        margins,
        ctx,
    }
}

impl Harness {
    pub fn sales_order(&self) -> SalesOrderId {
        self.controller
            .create_sales_order(
                &self.ctx,
                NewSalesOrder {
                    customer_id: PartyId::new(),
                    pricelist_id: None,
                    currency: None,
                    salesperson: None,
                },
            )
            .unwrap()
    }

    /// A fresh order with one line; returns the line and what the sync did.
    pub fn sales_line(
        &self,
        quantity: Decimal,
        unit_price: Decimal,
        quote_requested: bool,
    ) -> (SalesLineRef, ToggleOutcome) {
        let order_id = self.sales_order();
        self.controller
            .add_sales_line(
                &self.ctx,
                order_id,
                NewSalesLine {
                    product_id: ProductId::new(),
                    category_id: Some(CategoryId::new()),
                    quantity,
                    unit_price,
                    quote_requested,
                },
            )
            .unwrap()
    }
}
