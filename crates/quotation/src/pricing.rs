//! Price derivation rules.
//!
//! Margins are direct multipliers: `1.20` means "sell at purchase price × 1.20".
//! Every function here is pure.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use quoteflow_core::{DomainError, ValueObject};

/// Strictly positive margin multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Margin(Decimal);

impl Margin {
    pub fn new(multiplier: Decimal) -> Result<Self, DomainError> {
        if multiplier <= Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "margin must be a positive multiplier, got {multiplier}"
            )));
        }
        Ok(Self(multiplier))
    }

    pub fn multiplier(self) -> Decimal {
        self.0
    }
}

impl ValueObject for Margin {}

impl TryFrom<Decimal> for Margin {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Margin> for Decimal {
    fn from(value: Margin) -> Self {
        value.0
    }
}

impl core::fmt::Display for Margin {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// `initial × margin`.
///
/// A zero or unset initial price, or an unset margin, yields the initial price
/// unchanged. A product outside the decimal range is a validation error.
pub fn final_purchase_price(
    initial: Option<Decimal>,
    margin: Option<Margin>,
) -> Result<Option<Decimal>, DomainError> {
    match (initial, margin) {
        (Some(price), Some(margin)) if !price.is_zero() => price
            .checked_mul(margin.multiplier())
            .map(Some)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "price {price} with margin {} is out of range",
                    margin.multiplier()
                ))
            }),
        _ => Ok(initial),
    }
}

/// The sale value written back to the sales line equals the final purchase price.
pub fn final_sale_value(final_purchase_price: Decimal) -> Decimal {
    final_purchase_price
}

/// Zero or negative supplier prices mean "not quoted yet".
pub fn accepts_supplier_price(price: Decimal) -> bool {
    price > Decimal::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn margin(value: Decimal) -> Margin {
        Margin::new(value).unwrap()
    }

    #[test]
    fn multiplier_applies_to_positive_price() {
        assert_eq!(
            final_purchase_price(Some(dec!(100)), Some(margin(dec!(1.2)))).unwrap(),
            Some(dec!(120.0))
        );
        assert_eq!(
            final_purchase_price(Some(dec!(50)), Some(margin(dec!(1.1)))).unwrap(),
            Some(dec!(55.0))
        );
    }

    #[test]
    fn zero_or_unset_base_is_returned_unchanged() {
        assert_eq!(
            final_purchase_price(Some(dec!(0)), Some(margin(dec!(1.2)))).unwrap(),
            Some(dec!(0.0))
        );
        assert_eq!(
            final_purchase_price(None, Some(margin(dec!(1.2)))).unwrap(),
            None
        );
        assert_eq!(
            final_purchase_price(Some(dec!(80)), None).unwrap(),
            Some(dec!(80))
        );
    }

    #[test]
    fn out_of_range_product_is_a_validation_error() {
        let err = final_purchase_price(Some(Decimal::MAX / dec!(2)), Some(margin(dec!(3))))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let near_max = final_purchase_price(Some(Decimal::MAX / dec!(2)), Some(margin(dec!(1.5))));
        assert!(near_max.unwrap().is_some());
    }

    #[test]
    fn margin_rejects_non_positive_values() {
        assert!(Margin::new(dec!(0)).is_err());
        assert!(Margin::new(dec!(-1.2)).is_err());
        assert!(serde_json::from_str::<Margin>("\"0\"").is_err());
    }

    #[test]
    fn supplier_price_must_be_strictly_positive() {
        assert!(!accepts_supplier_price(dec!(0)));
        assert!(!accepts_supplier_price(dec!(-3)));
        assert!(accepts_supplier_price(dec!(0.01)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the price rule is pure (same inputs, same output).
        #[test]
        fn price_rule_is_idempotent(
            cents in 0i64..10_000_000i64,
            margin_bp in 1i64..50_000i64,
        ) {
            let initial = Some(Decimal::new(cents, 2));
            let m = Some(Margin::new(Decimal::new(margin_bp, 4)).unwrap());

            let first = final_purchase_price(initial, m).unwrap();
            let second = final_purchase_price(initial, m).unwrap();
            prop_assert_eq!(first, second);
            prop_assert_eq!(final_sale_value(first.unwrap()), first.unwrap());
        }

        /// Property: a margin of exactly 1 never changes the price.
        #[test]
        fn unit_margin_is_identity(cents in 0i64..10_000_000i64) {
            let initial = Some(Decimal::new(cents, 2));
            let one = Some(Margin::new(Decimal::ONE).unwrap());
            prop_assert_eq!(final_purchase_price(initial, one).unwrap(), initial);
        }
    }
}
