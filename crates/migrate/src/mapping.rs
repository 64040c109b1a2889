//! Legacy column and label tables.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use quoteflow_quotation::{Margin, Priority, Stage};

/// Legacy column holding the stage label (or stage id).
pub const LEGACY_STAGE_COLUMN: &str = "x_studio_stage_id";

/// Legacy column → canonical field.
///
/// `None` marks a column that is read but mapped by dedicated code.
pub const COLUMN_MAP: &[(&str, Option<&str>)] = &[
    ("x_name", Some("reference")),
    ("x_studio_priority", Some("priority")),
    (LEGACY_STAGE_COLUMN, None),
    ("x_studio_product_id", Some("product_id")),
    ("x_studio_quantity", Some("quantity")),
    ("x_studio_supplier_id", Some("supplier_id")),
    ("x_studio_currency_id", Some("currency")),
    ("x_studio_exchange_rate", Some("exchange_rate")),
    ("x_studio_lead_time", Some("lead_time_days")),
    ("x_studio_purchase_price", Some("initial_purchase_price")),
    ("x_studio_margin", Some("margin")),
    ("x_studio_sale_order_id", Some("sales_order_id")),
    ("x_studio_sale_line_id", Some("sales_line_id")),
    ("x_studio_partner_id", Some("customer_id")),
    ("x_studio_pricelist_id", Some("pricelist_id")),
    ("x_studio_user_id", Some("responsible")),
    ("x_studio_date", Some("requested_at")),
    ("x_studio_date_start", Some("period_start")),
    ("x_studio_date_stop", Some("period_stop")),
    ("x_studio_date_done", Some("completed_on")),
    ("x_studio_sale_currency_id", Some("sales_currency")),
    ("x_studio_sale_value", Some("sales_value_snapshot")),
];

/// Legacy stage label (lowercase) → stage.
pub const STAGE_MAP: &[(&str, Stage)] = &[
    ("borrador", Stage::New),
    ("draft", Stage::New),
    ("solicitado", Stage::New),
    ("requested", Stage::New),
    ("nuevo", Stage::New),
    ("1", Stage::New),
    ("cotizado", Stage::InProgress),
    ("quoted", Stage::InProgress),
    ("en_progreso", Stage::InProgress),
    ("2", Stage::InProgress),
    ("listo", Stage::Done),
    ("ready", Stage::Done),
    ("done", Stage::Done),
    ("3", Stage::Done),
];

/// Canonical fields that must hold a decimal.
pub(crate) const DECIMAL_FIELDS: &[&str] = &[
    "quantity",
    "exchange_rate",
    "initial_purchase_price",
    "sales_value_snapshot",
];

/// Stage for a legacy label or numeric stage id; `None` when unrecognised.
pub fn map_stage(raw: &JsonValue) -> Option<Stage> {
    let label = label_of(raw)?;
    STAGE_MAP
        .iter()
        .find(|(legacy, _)| *legacy == label)
        .map(|(_, stage)| *stage)
}

/// Priority for a legacy value (`"0"`/`"1"` or a label).
pub fn map_priority(raw: &JsonValue) -> Option<Priority> {
    match label_of(raw)?.as_str() {
        "0" | "normal" => Some(Priority::Normal),
        "1" | "urgent" | "urgente" => Some(Priority::Urgent),
        _ => None,
    }
}

fn label_of(raw: &JsonValue) -> Option<String> {
    match raw {
        JsonValue::String(s) => Some(s.trim().to_lowercase()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Decimal from a JSON number or numeric string.
pub(crate) fn decimal_of(raw: &JsonValue) -> Option<Decimal> {
    match raw {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Legacy margins of zero mean "unset"; anything else must be a valid multiplier.
pub(crate) fn margin_of(raw: &JsonValue) -> Result<Option<Margin>, String> {
    let value = decimal_of(raw).ok_or_else(|| format!("margin '{raw}' is not a number"))?;
    if value.is_zero() {
        return Ok(None);
    }
    Margin::new(value).map(Some).map_err(|e| e.to_string())
}
