//! External collaborators consumed by the workflow, with in-memory
//! implementations for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use quoteflow_core::{CategoryId, CompanyId};
use quoteflow_quotation::Margin;

use crate::config::WorkflowConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("unknown sequence '{0}'")]
    UnknownSequence(String),
    #[error("sequence '{0}' is exhausted")]
    Exhausted(String),
    #[error("reference allocator unavailable: {0}")]
    Unavailable(String),
}

/// Allocates human-readable references. A sequence never repeats a value.
pub trait ReferenceAllocator: Send + Sync {
    fn next_reference(
        &self,
        company_id: CompanyId,
        sequence_name: &str,
    ) -> Result<String, ReferenceError>;
}

impl<T> ReferenceAllocator for Arc<T>
where
    T: ReferenceAllocator + ?Sized,
{
    fn next_reference(
        &self,
        company_id: CompanyId,
        sequence_name: &str,
    ) -> Result<String, ReferenceError> {
        (**self).next_reference(company_id, sequence_name)
    }
}

/// Counter-backed allocator producing `PREFIX/00001`, `PREFIX/00002`, ...
#[derive(Debug)]
pub struct InMemoryReferenceAllocator {
    sequence_name: String,
    prefix: String,
    padding: usize,
    counters: RwLock<HashMap<CompanyId, u64>>,
}

impl InMemoryReferenceAllocator {
    pub fn new(
        sequence_name: impl Into<String>,
        prefix: impl Into<String>,
        padding: usize,
    ) -> Self {
        Self {
            sequence_name: sequence_name.into(),
            prefix: prefix.into(),
            padding,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self::new(
            config.sequence_name.clone(),
            config.reference_prefix.clone(),
            config.reference_padding,
        )
    }
}

impl ReferenceAllocator for InMemoryReferenceAllocator {
    fn next_reference(
        &self,
        company_id: CompanyId,
        sequence_name: &str,
    ) -> Result<String, ReferenceError> {
        if sequence_name != self.sequence_name {
            return Err(ReferenceError::UnknownSequence(sequence_name.to_string()));
        }

        let mut counters = self
            .counters
            .write()
            .map_err(|_| ReferenceError::Unavailable("lock poisoned".to_string()))?;
        let counter = counters.entry(company_id).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| ReferenceError::Exhausted(sequence_name.to_string()))?;

        Ok(format!("{}/{:0width$}", self.prefix, *counter, width = self.padding))
    }
}

/// Default margin per product category, used to pre-fill margins on import.
pub trait CategoryMarginLookup: Send + Sync {
    fn default_margin(&self, company_id: CompanyId, category_id: CategoryId) -> Option<Margin>;
}

impl<T> CategoryMarginLookup for Arc<T>
where
    T: CategoryMarginLookup + ?Sized,
{
    fn default_margin(&self, company_id: CompanyId, category_id: CategoryId) -> Option<Margin> {
        (**self).default_margin(company_id, category_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCategoryMargins {
    margins: RwLock<HashMap<(CompanyId, CategoryId), Margin>>,
}

impl InMemoryCategoryMargins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, company_id: CompanyId, category_id: CategoryId, margin: Margin) {
        if let Ok(mut margins) = self.margins.write() {
            margins.insert((company_id, category_id), margin);
        }
    }
}

impl CategoryMarginLookup for InMemoryCategoryMargins {
    fn default_margin(&self, company_id: CompanyId, category_id: CategoryId) -> Option<Margin> {
        let margins = self.margins.read().ok()?;
        margins.get(&(company_id, category_id)).copied()
    }
}
