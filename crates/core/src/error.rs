//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only (validation, preconditions, invariants,
/// conflicts). Infrastructure concerns belong elsewhere.
///
/// `Precondition` and `NoEligibleRequests` are user-actionable. `DuplicateLink`
/// and `InvariantViolation` indicate a bug and are surfaced separately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transition was attempted without its required fields or stage.
    #[error("precondition failed for '{reference}': {reason}")]
    Precondition { reference: String, reason: String },

    /// A batch operation was invoked on an empty or fully-ineligible set.
    #[error("no eligible requests: {0}")]
    NoEligibleRequests(String),

    /// More than one live link was found where at most one may exist.
    #[error("duplicate link for '{reference}': {reason}")]
    DuplicateLink { reference: String, reason: String },

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn precondition(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Precondition {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn no_eligible_requests(msg: impl Into<String>) -> Self {
        Self::NoEligibleRequests(msg.into())
    }

    pub fn duplicate_link(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DuplicateLink {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// True for errors that point at a bug rather than at user input.
    pub fn is_invariant_breach(&self) -> bool {
        matches!(
            self,
            DomainError::DuplicateLink { .. } | DomainError::InvariantViolation(_)
        )
    }
}
