//! The reconciliation run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quoteflow_quotation::{Priority, Stage};

use crate::mapping::{
    COLUMN_MAP, DECIMAL_FIELDS, LEGACY_STAGE_COLUMN, decimal_of, map_priority, map_stage,
    margin_of,
};
use crate::snapshot::{Automation, LegacyDatabase, LegacyRow, ReconciledRequest};
use crate::MigrationError;

/// What to reconcile and which automations count as stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationPlan {
    pub legacy_table: String,
    /// Code automations mentioning any of these are deactivated and unbound.
    pub obsolete_markers: Vec<String>,
    /// Code automations whose whole body is one of these are unbound.
    pub unbind_codes: Vec<String>,
}

impl Default for MigrationPlan {
    fn default() -> Self {
        Self {
            legacy_table: "x_productos_a_cotizar".to_string(),
            obsolete_markers: vec![
                "x_productos_a_cotizar".to_string(),
                "x_studio_".to_string(),
                "uom_po_id".to_string(),
            ],
            unbind_codes: vec![
                "records.action_create_purchase_orders()".to_string(),
                "records.action_import_purchase_price()".to_string(),
                "records.action_boton_listo()".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    /// Legacy row id, or its position when the id itself is unusable.
    pub row: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub table_found: bool,
    /// Canonical fields that had a source column.
    pub mapped_fields: Vec<String>,
    pub rows_read: usize,
    pub reconciled: usize,
    pub already_reconciled: usize,
    /// Rows with no value in any mapped column.
    pub skipped_empty: usize,
    /// Rows whose stage label was unrecognised and defaulted to `new`.
    pub unknown_stages: usize,
    pub failures: Vec<RowFailure>,
    pub automations_deactivated: usize,
    pub automations_unbound: usize,
}

impl MigrationReport {
    /// Whether the run wrote anything.
    pub fn changed(&self) -> bool {
        self.reconciled > 0 || self.automations_deactivated > 0 || self.automations_unbound > 0
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Run the reconciliation against `db`.
///
/// Only storage errors abort the run; a row that cannot be mapped is logged
/// and recorded in the report.
pub fn reconcile<D: LegacyDatabase>(
    db: &mut D,
    plan: &MigrationPlan,
) -> Result<MigrationReport, MigrationError> {
    let mut report = MigrationReport::default();

    reconcile_rows(db, plan, &mut report)?;
    retire_automations(db, plan, &mut report)?;

    tracing::info!(
        table = %plan.legacy_table,
        rows = report.rows_read,
        reconciled = report.reconciled,
        already_reconciled = report.already_reconciled,
        failed = report.failed(),
        deactivated = report.automations_deactivated,
        unbound = report.automations_unbound,
        "legacy reconciliation finished"
    );
    Ok(report)
}

fn reconcile_rows<D: LegacyDatabase>(
    db: &mut D,
    plan: &MigrationPlan,
    report: &mut MigrationReport,
) -> Result<(), MigrationError> {
    let Some(columns) = db.table_columns(&plan.legacy_table)? else {
        tracing::info!(
            table = %plan.legacy_table,
            "legacy table not found; skipping row reconciliation"
        );
        return Ok(());
    };
    report.table_found = true;

    let mappings: Vec<(&str, &str)> = COLUMN_MAP
        .iter()
        .filter(|(legacy, _)| columns.iter().any(|c| c == legacy))
        .filter_map(|(legacy, canonical)| (*canonical).map(|c| (*legacy, c)))
        .collect();
    if mappings.is_empty() {
        tracing::warn!(
            table = %plan.legacy_table,
            columns = ?columns,
            "legacy table has no mappable columns"
        );
        return Ok(());
    }
    report.mapped_fields = mappings.iter().map(|(_, c)| c.to_string()).collect();

    let has_stage = columns.iter().any(|c| c == LEGACY_STAGE_COLUMN);
    let mut wanted: Vec<&str> = mappings.iter().map(|(legacy, _)| *legacy).collect();
    if has_stage {
        wanted.push(LEGACY_STAGE_COLUMN);
    }

    let rows = db.fetch_rows(&plan.legacy_table, &wanted)?;
    report.rows_read = rows.len();

    for (position, row) in rows.iter().enumerate() {
        let Some(legacy_id) = row.get("id").and_then(JsonValue::as_i64) else {
            fail(report, format!("#{position}"), "row has no integer id");
            continue;
        };
        if db.is_reconciled(legacy_id)? {
            report.already_reconciled += 1;
            continue;
        }

        match map_row(legacy_id, row, &mappings, has_stage) {
            Ok(Some(mapped)) => {
                if mapped.unknown_stage {
                    report.unknown_stages += 1;
                }
                match db.insert_request(mapped.request) {
                    Ok(()) => report.reconciled += 1,
                    Err(err) => fail(report, legacy_id.to_string(), err.to_string()),
                }
            }
            Ok(None) => report.skipped_empty += 1,
            Err(reason) => fail(report, legacy_id.to_string(), reason),
        }
    }
    Ok(())
}

struct MappedRow {
    request: ReconciledRequest,
    unknown_stage: bool,
}

fn map_row(
    legacy_id: i64,
    row: &LegacyRow,
    mappings: &[(&str, &str)],
    has_stage: bool,
) -> Result<Option<MappedRow>, String> {
    let mut fields = BTreeMap::new();
    let mut priority = Priority::Normal;

    for (legacy, canonical) in mappings {
        let Some(value) = row.get(*legacy).filter(|v| !v.is_null()) else {
            continue;
        };
        match *canonical {
            "priority" => {
                priority = map_priority(value)
                    .ok_or_else(|| format!("unknown priority '{value}'"))?;
                fields.insert(canonical.to_string(), value.clone());
            }
            "margin" => {
                if let Some(margin) = margin_of(value)? {
                    fields.insert(
                        canonical.to_string(),
                        JsonValue::String(margin.multiplier().to_string()),
                    );
                }
            }
            field if DECIMAL_FIELDS.contains(&field) => {
                let amount =
                    decimal_of(value).ok_or_else(|| format!("{field} '{value}' is not a number"))?;
                fields.insert(field.to_string(), JsonValue::String(amount.to_string()));
            }
            field => {
                fields.insert(field.to_string(), value.clone());
            }
        }
    }

    let raw_stage = has_stage
        .then(|| row.get(LEGACY_STAGE_COLUMN))
        .flatten()
        .filter(|v| !v.is_null());
    if fields.is_empty() && raw_stage.is_none() {
        return Ok(None);
    }

    let mut unknown_stage = false;
    let stage = match raw_stage {
        Some(raw) => map_stage(raw).unwrap_or_else(|| {
            tracing::warn!(legacy_id, stage = %raw, "unrecognised legacy stage; using new");
            unknown_stage = true;
            Stage::New
        }),
        None => Stage::New,
    };

    Ok(Some(MappedRow {
        request: ReconciledRequest {
            legacy_id,
            stage,
            priority,
            fields,
        },
        unknown_stage,
    }))
}

fn fail(report: &mut MigrationReport, row: String, reason: impl Into<String>) {
    let reason = reason.into();
    tracing::warn!(row = %row, "legacy row not reconciled: {reason}");
    report.failures.push(RowFailure { row, reason });
}

fn retire_automations<D: LegacyDatabase>(
    db: &mut D,
    plan: &MigrationPlan,
    report: &mut MigrationReport,
) -> Result<(), MigrationError> {
    for automation in db.automations()? {
        if !automation.is_code() {
            continue;
        }
        let stale = is_stale(&automation, plan);

        if stale && db.deactivate_automation(automation.id)? {
            report.automations_deactivated += 1;
            tracing::info!(
                id = automation.id,
                name = %automation.name,
                "deactivated stale automation"
            );
        }

        let named = plan.unbind_codes.iter().any(|c| c == automation.code.trim());
        if (stale || named) && db.unbind_automation(automation.id)? {
            report.automations_unbound += 1;
            tracing::info!(
                id = automation.id,
                name = %automation.name,
                "unbound automation from menu"
            );
        }
    }
    Ok(())
}

fn is_stale(automation: &Automation, plan: &MigrationPlan) -> bool {
    plan.obsolete_markers
        .iter()
        .any(|marker| automation.code.contains(marker.as_str()))
}
