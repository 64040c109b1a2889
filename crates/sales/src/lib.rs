//! Sales Orders domain module (event-sourced).
//!
//! Only the slice of sales orders the quotation workflow touches: lines with a
//! "request quotation" toggle, the link to the request created for a line, and
//! the unit-price write-back once a sale price is known. Pure domain logic
//! (no IO, no storage).

pub mod order;

pub use order::{
    AGGREGATE_TYPE, AddLine, ApplyQuotedPrice, CreateSalesOrder, LineAdded, LineUnitPriceUpdated,
    LinkQuotationRequest, QuotationRequestLinked, QuotationRequestUnlinked, RequestToggled,
    SalesLine, SalesLineRef, SalesOrder, SalesOrderCommand, SalesOrderCreated, SalesOrderEvent,
    SalesOrderId, SetQuoteRequested, UnlinkQuotationRequest,
};
