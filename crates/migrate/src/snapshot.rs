//! Legacy database access.
//!
//! [`LegacyDatabase`] is the seam the reconciler works against. The
//! [`JsonSnapshot`] backend reads and writes a JSON export of the legacy
//! tables, which is what the command-line tool operates on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quoteflow_quotation::{Priority, Stage};

use crate::MigrationError;

/// One legacy row, keyed by column name.
pub type LegacyRow = BTreeMap<String, JsonValue>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyTable {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<LegacyRow>,
}

/// A stored automation (server action) of the legacy system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Automation {
    pub id: i64,
    pub name: String,
    /// Execution kind; only `"code"` automations are touched.
    pub kind: String,
    #[serde(default)]
    pub code: String,
    pub active: bool,
    /// Whether the automation is bound to a record menu.
    pub bound: bool,
}

impl Automation {
    pub fn is_code(&self) -> bool {
        self.kind == "code"
    }
}

/// Canonical request record produced from one legacy row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRequest {
    pub legacy_id: i64,
    pub stage: Stage,
    pub priority: Priority,
    /// Canonical field → value, for every mapped column that held a value.
    pub fields: BTreeMap<String, JsonValue>,
}

pub trait LegacyDatabase {
    /// Column names of `table`, or `None` when the table does not exist.
    fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, MigrationError>;

    /// Rows of `table` restricted to `id` plus `columns`.
    fn fetch_rows(&self, table: &str, columns: &[&str]) -> Result<Vec<LegacyRow>, MigrationError>;

    fn is_reconciled(&self, legacy_id: i64) -> Result<bool, MigrationError>;

    fn insert_request(&mut self, request: ReconciledRequest) -> Result<(), MigrationError>;

    fn automations(&self) -> Result<Vec<Automation>, MigrationError>;

    /// Returns whether anything changed.
    fn deactivate_automation(&mut self, id: i64) -> Result<bool, MigrationError>;

    /// Returns whether anything changed.
    fn unbind_automation(&mut self, id: i64) -> Result<bool, MigrationError>;
}

/// Serialized form of a legacy export plus the reconciled output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub tables: BTreeMap<String, LegacyTable>,
    pub automations: Vec<Automation>,
    pub requests: Vec<ReconciledRequest>,
}

/// [`LegacyDatabase`] over a JSON snapshot, in memory until [`save`](Self::save).
#[derive(Debug, Clone, Default)]
pub struct JsonSnapshot {
    path: Option<PathBuf>,
    data: Snapshot,
}

impl JsonSnapshot {
    pub fn new(data: Snapshot) -> Self {
        Self { path: None, data }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let data = serde_json::from_str(&raw)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            data,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, MigrationError> {
        Ok(Self::new(serde_json::from_str(raw)?))
    }

    /// Write back to `path`, or to the file it was loaded from.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf, MigrationError> {
        let target = path
            .map(Path::to_path_buf)
            .or_else(|| self.path.clone())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no snapshot path")
            })?;
        std::fs::write(&target, serde_json::to_string_pretty(&self.data)?)?;
        Ok(target)
    }

    pub fn data(&self) -> &Snapshot {
        &self.data
    }

    pub fn into_inner(self) -> Snapshot {
        self.data
    }

    fn automation_mut(&mut self, id: i64) -> Result<&mut Automation, MigrationError> {
        self.data
            .automations
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(MigrationError::UnknownAutomation(id))
    }
}

impl LegacyDatabase for JsonSnapshot {
    fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>, MigrationError> {
        Ok(self.data.tables.get(table).map(|t| t.columns.clone()))
    }

    fn fetch_rows(&self, table: &str, columns: &[&str]) -> Result<Vec<LegacyRow>, MigrationError> {
        let Some(table) = self.data.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(table
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|(column, _)| {
                        column.as_str() == "id" || columns.contains(&column.as_str())
                    })
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .collect()
            })
            .collect())
    }

    fn is_reconciled(&self, legacy_id: i64) -> Result<bool, MigrationError> {
        Ok(self.data.requests.iter().any(|r| r.legacy_id == legacy_id))
    }

    fn insert_request(&mut self, request: ReconciledRequest) -> Result<(), MigrationError> {
        if self.is_reconciled(request.legacy_id)? {
            return Err(MigrationError::AlreadyReconciled(request.legacy_id));
        }
        self.data.requests.push(request);
        Ok(())
    }

    fn automations(&self) -> Result<Vec<Automation>, MigrationError> {
        Ok(self.data.automations.clone())
    }

    fn deactivate_automation(&mut self, id: i64) -> Result<bool, MigrationError> {
        let automation = self.automation_mut(id)?;
        let changed = automation.active;
        automation.active = false;
        Ok(changed)
    }

    fn unbind_automation(&mut self, id: i64) -> Result<bool, MigrationError> {
        let automation = self.automation_mut(id)?;
        let changed = automation.bound;
        automation.bound = false;
        Ok(changed)
    }
}
