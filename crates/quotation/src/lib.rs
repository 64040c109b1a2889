//! Quotation Requests domain module (event-sourced).
//!
//! A quotation request asks purchasing for a supplier price on a product and
//! quantity, optionally on behalf of a sales line. This crate holds the pure
//! domain logic:
//!
//! - [`stage`]: the fixed forward-only lifecycle (`new → in_progress → done`)
//! - [`pricing`]: margin and price derivation rules
//! - [`request`]: the `QuotationRequest` aggregate
//! - [`grouping`]: the planner that partitions a batch into purchase orders

pub mod grouping;
pub mod pricing;
pub mod request;
pub mod stage;

pub use grouping::{GroupKey, GroupingDefaults, GroupingStrategy, OrderPlan, plan_purchase_orders};
pub use pricing::{Margin, accepts_supplier_price, final_purchase_price, final_sale_value};
pub use request::{
    AGGREGATE_TYPE, CreateRequest, Finalize, ImportPurchasePrice, MarginSet, MarkAggregated,
    PurchasePriceImported, PurchasingTerms, QuotationRequest, QuotationRequestCommand,
    QuotationRequestEvent, QuotationRequestId, RequestCreated, RequestFinalized, RequestRevised,
    RequestRevision, RequestWithdrawn, ReviseRequest, SalesContext, SetMargin,
    SubmittedForPurchase, Withdraw,
};
pub use stage::{Priority, Stage};
