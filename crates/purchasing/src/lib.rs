//! Purchasing domain module (Purchase Orders, event-sourced).
//!
//! Purchase orders here are requests for quotation: the workflow creates them
//! with one line per quotation request, and the purchasing actor records the
//! supplier's quoted price on each line. Pure domain logic (no IO, no storage).

pub mod order;

pub use order::{
    AGGREGATE_TYPE, AddLine, CreatePurchaseOrder, PurchaseLine, PurchaseLineRef, PurchaseOrder,
    PurchaseOrderCommand, PurchaseOrderCreated, PurchaseOrderEvent, PurchaseOrderId,
    PurchaseOrderLineAdded, RecordSupplierQuote, SupplierQuoteRecorded,
};
