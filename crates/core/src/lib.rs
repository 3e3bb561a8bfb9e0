//! Shared primitives for all Rust crates in Fleetgate.

#![forbid(unsafe_code)]

/// Execution context primitives shared across services.
pub mod context;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use context::ExecutionContext;

/// Result type used across Fleetgate crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl Display for NonEmptyString {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Tenant identifier used as the partition key for every persisted resource
/// and every lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Creates a random tenant identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a tenant identifier from an existing UUID value.
    #[must_use]
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// Returns the underlying UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TenantId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant, including malformed filter queries.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced target, action, filter query or distribution set does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Cancellation or cancellation feedback is not allowed for the action.
    #[error("cancel not allowed: {0}")]
    CancelNotAllowed(String),

    /// Status, message, attribute or assignment limits were exceeded.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Optimistic concurrency check failed; the write may be retried.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Entity with the same identity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true when the failed operation may be retried transparently.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{AppError, NonEmptyString, TenantId};

    #[test]
    fn non_empty_string_rejects_whitespace() {
        let result = NonEmptyString::new("   ");
        assert!(result.is_err());
    }

    #[test]
    fn tenant_id_formats_as_uuid() {
        let tenant_id = TenantId::new();
        assert_eq!(tenant_id.to_string().len(), 36);
    }

    #[test]
    fn only_concurrency_conflicts_are_retryable() {
        assert!(AppError::ConcurrencyConflict("version".to_owned()).is_retryable());
        assert!(!AppError::AlreadyExists("target".to_owned()).is_retryable());
        assert!(!AppError::QuotaExceeded("status".to_owned()).is_retryable());
        assert!(!AppError::NotFound("action".to_owned()).is_retryable());
    }
}
