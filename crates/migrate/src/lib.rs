//! Legacy quotation-request reconciliation.
//!
//! Copies rows from the legacy quotation table into canonical request
//! records and retires automations that still point at the legacy fields.
//! Running it twice is a no-op the second time.
//!
//! - [`mapping`]: legacy column and stage label tables
//! - [`snapshot`]: the [`LegacyDatabase`] seam and its JSON snapshot backend
//! - [`reconcile`]: the migration run and its report

pub mod mapping;
pub mod reconcile;
pub mod snapshot;

pub use mapping::{COLUMN_MAP, LEGACY_STAGE_COLUMN, STAGE_MAP, map_priority, map_stage};
pub use reconcile::{MigrationPlan, MigrationReport, RowFailure, reconcile};
pub use snapshot::{
    Automation, JsonSnapshot, LegacyDatabase, LegacyRow, LegacyTable, ReconciledRequest, Snapshot,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("legacy row {0} is already reconciled")]
    AlreadyReconciled(i64),

    #[error("unknown automation {0}")]
    UnknownAutomation(i64),
}
