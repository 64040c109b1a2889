//! Projection implementations (read model builders).
//!
//! Projections consume committed events and build query-optimized read models.
//! They are rebuildable from the event store, company-isolated and idempotent
//! under at-least-once delivery.

pub mod quotation_requests;

pub use quotation_requests::{RequestDirectory, RequestDirectoryError, RequestSummary};
