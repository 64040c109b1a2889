//! Grouping planner for submit-for-purchase.
//!
//! Partitions a batch of `new` requests by `(counterparty, currency)` and
//! returns one [`OrderPlan`] per group. The planner validates the whole batch
//! before returning anything, so callers either get a complete plan or an
//! error and can create purchase orders without partial-failure handling.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quoteflow_core::{CurrencyCode, DomainError, PartyId};

use crate::request::{QuotationRequest, QuotationRequestId};
use crate::stage::Stage;

/// How the counterparty of a generated purchase order is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// Every order goes to the company's own partner as a placeholder, to be
    /// corrected downstream. Requests are grouped by currency only.
    #[default]
    CurrencyOnly,
    /// Every order goes to the request's explicit supplier.
    SupplierAndCurrency,
}

impl GroupingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupingStrategy::CurrencyOnly => "currency_only",
            GroupingStrategy::SupplierAndCurrency => "supplier_and_currency",
        }
    }
}

impl core::fmt::Display for GroupingStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupingStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "currency_only" => Ok(GroupingStrategy::CurrencyOnly),
            "supplier_and_currency" => Ok(GroupingStrategy::SupplierAndCurrency),
            other => Err(DomainError::validation(format!(
                "unknown grouping strategy '{other}'"
            ))),
        }
    }
}

/// Company-level fallbacks used while resolving group keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingDefaults {
    /// The deploying company's own partner.
    pub placeholder_counterparty: PartyId,
    pub company_currency: CurrencyCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub counterparty: PartyId,
    pub currency: CurrencyCode,
}

impl GroupKey {
    pub fn resolve(
        request: &QuotationRequest,
        strategy: GroupingStrategy,
        defaults: &GroupingDefaults,
    ) -> Result<Self, DomainError> {
        let counterparty = match strategy {
            GroupingStrategy::CurrencyOnly => defaults.placeholder_counterparty,
            GroupingStrategy::SupplierAndCurrency => request.supplier_id().ok_or_else(|| {
                DomainError::precondition(request.reference(), "supplier is not set")
            })?,
        };
        let currency = request
            .purchase_currency()
            .cloned()
            .unwrap_or_else(|| defaults.company_currency.clone());

        Ok(Self {
            counterparty,
            currency,
        })
    }
}

/// One purchase order to create, with its requests in line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPlan {
    pub key: GroupKey,
    /// Earliest `period_stop` among the members.
    pub date_planned: Option<DateTime<Utc>>,
    pub members: Vec<QuotationRequestId>,
}

/// Plans the purchase orders for a batch.
///
/// Groups come out in order of first appearance; members keep input order.
/// A request listed twice is planned once.
pub fn plan_purchase_orders(
    requests: &[&QuotationRequest],
    strategy: GroupingStrategy,
    defaults: &GroupingDefaults,
) -> Result<Vec<OrderPlan>, DomainError> {
    if requests.is_empty() {
        return Err(DomainError::no_eligible_requests(
            "no requests were selected for purchase",
        ));
    }

    if let Some(missing) = requests
        .iter()
        .find(|request| !request.is_created() || request.is_withdrawn())
    {
        return Err(DomainError::precondition(
            missing.id_typed().to_string(),
            "request does not exist",
        ));
    }
    if requests.iter().all(|request| request.stage() != Stage::New) {
        return Err(DomainError::no_eligible_requests(format!(
            "none of the selected requests is in stage '{}'",
            Stage::New
        )));
    }

    let mut plans: Vec<OrderPlan> = Vec::new();
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut seen: HashSet<QuotationRequestId> = HashSet::new();

    for request in requests {
        if request.stage() != Stage::New {
            return Err(DomainError::precondition(
                request.reference(),
                format!(
                    "only requests in stage '{}' can be submitted for purchase (found '{}')",
                    Stage::New,
                    request.stage()
                ),
            ));
        }
        if !seen.insert(request.id_typed()) {
            continue;
        }

        let key = GroupKey::resolve(request, strategy, defaults)?;
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            plans.push(OrderPlan {
                key,
                date_planned: None,
                members: Vec::new(),
            });
            plans.len() - 1
        });

        let plan = &mut plans[slot];
        plan.members.push(request.id_typed());
        plan.date_planned = match (plan.date_planned, request.period_stop()) {
            (Some(current), Some(stop)) => Some(current.min(stop)),
            (current, stop) => current.or(stop),
        };
    }

    Ok(plans)
}
