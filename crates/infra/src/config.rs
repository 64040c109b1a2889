//! Workflow configuration.
//!
//! Loaded from environment variables with defaults, or deserialized from JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use quoteflow_quotation::GroupingStrategy;

pub const GROUPING_STRATEGY_ENV: &str = "QUOTEFLOW_GROUPING_STRATEGY";
pub const SEQUENCE_NAME_ENV: &str = "QUOTEFLOW_SEQUENCE_NAME";
pub const REFERENCE_PREFIX_ENV: &str = "QUOTEFLOW_REFERENCE_PREFIX";
pub const REFERENCE_PADDING_ENV: &str = "QUOTEFLOW_REFERENCE_PADDING";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub grouping_strategy: GroupingStrategy,
    /// Sequence the reference allocator draws request references from.
    pub sequence_name: String,
    pub reference_prefix: String,
    /// Zero-padded width of the numeric part of a reference.
    pub reference_padding: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            grouping_strategy: GroupingStrategy::CurrencyOnly,
            sequence_name: "quotation.request".to_string(),
            reference_prefix: "RFQ".to_string(),
            reference_padding: 5,
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(GROUPING_STRATEGY_ENV) {
            config.grouping_strategy = raw
                .parse()
                .map_err(|e| ConfigError::invalid(GROUPING_STRATEGY_ENV, format!("{e}")))?;
        }
        if let Some(raw) = lookup(SEQUENCE_NAME_ENV) {
            config.sequence_name = raw.trim().to_string();
        }
        if let Some(raw) = lookup(REFERENCE_PREFIX_ENV) {
            config.reference_prefix = raw.trim().to_string();
        }
        if let Some(raw) = lookup(REFERENCE_PADDING_ENV) {
            config.reference_padding = raw.trim().parse().map_err(|_| {
                ConfigError::invalid(REFERENCE_PADDING_ENV, format!("'{raw}' is not a width"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sequence_name.is_empty() {
            return Err(ConfigError::invalid(SEQUENCE_NAME_ENV, "must not be empty"));
        }
        if self.reference_prefix.is_empty() {
            return Err(ConfigError::invalid(REFERENCE_PREFIX_ENV, "must not be empty"));
        }
        if !(1..=12).contains(&self.reference_padding) {
            return Err(ConfigError::invalid(
                REFERENCE_PADDING_ENV,
                "must be between 1 and 12",
            ));
        }
        Ok(())
    }
}
