use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FILTER_ENV: &str = "RUST_LOG";
pub const FORMAT_ENV: &str = "QUOTEFLOW_LOG_FORMAT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObservabilityConfigError {
    #[error("unknown log format '{0}' (expected 'json' or 'text')")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = ObservabilityConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(ObservabilityConfigError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives, e.g. `info,quoteflow_infra=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Result<Self, ObservabilityConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), falling back to defaults on bad values.
    pub fn from_env_or_default() -> Self {
        Self::from_env().unwrap_or_default()
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ObservabilityConfigError> {
        let mut config = Self::default();
        if let Some(filter) = lookup(FILTER_ENV).filter(|f| !f.trim().is_empty()) {
            config.filter = filter;
        }
        if let Some(format) = lookup(FORMAT_ENV) {
            config.format = format.parse()?;
        }
        Ok(config)
    }
}
