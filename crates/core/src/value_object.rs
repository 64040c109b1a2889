//! Value objects: equality by value, not identity.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values. To
/// "modify" one, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// ISO-4217 currency code (three upper-case ASCII letters, e.g. `USD`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Parse and normalise a currency code (`"usd"` becomes `USD`).
    pub fn parse(code: impl AsRef<str>) -> Result<Self, DomainError> {
        let code = code.as_ref().trim();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(DomainError::validation(format!(
                "currency code must be three letters, got '{code}'"
            )));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for CurrencyCode {}

impl core::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CurrencyCode> for String {
    fn from(value: CurrencyCode) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_code_is_normalised() {
        assert_eq!(CurrencyCode::parse(" eur ").unwrap().as_str(), "EUR");
    }

    #[test]
    fn currency_code_rejects_bad_input() {
        assert!(CurrencyCode::parse("EURO").is_err());
        assert!(CurrencyCode::parse("U5D").is_err());
    }

    #[test]
    fn currency_code_deserialization_validates() {
        let ok: CurrencyCode = serde_json::from_str("\"ars\"").unwrap();
        assert_eq!(ok.as_str(), "ARS");
        assert!(serde_json::from_str::<CurrencyCode>("\"pesos\"").is_err());
    }
}
