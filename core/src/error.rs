//! Domain and validation errors.
//!
//! | Error | Raised at | Handling |
//! |---|---|---|
//! | [`ValidationError`] | inbound boundary | rejected synchronously, never enqueued |
//! | [`DomainError::NotFound`] / [`DomainError::NotOwner`] | domain store | rendered as a reply, not retried |
//! | [`DomainError::Store`] | domain store | retried if transient |

use crate::store::StoreError;
use crate::todo::TodoId;
use thiserror::Error;

/// Outcome of a domain operation that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// No todo with this id exists (or it was deleted, for edits).
    #[error("Todo #{0} not found")]
    NotFound(TodoId),

    /// The todo exists but belongs to another user.
    #[error("Todo #{0} is not owned by the caller")]
    NotOwner(TodoId),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DomainError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::NotOwner(_) => false,
            Self::Store(e) => e.is_transient(),
        }
    }
}

/// Bad or missing input at a boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {field}: {message}")]
pub struct ValidationError {
    /// Offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for `field`.
    #[must_use]
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_not_retried() {
        assert!(!DomainError::NotFound(TodoId(1)).is_transient());
        assert!(!DomainError::NotOwner(TodoId(1)).is_transient());
        assert!(DomainError::from(StoreError::Database("down".to_string())).is_transient());
    }

    #[test]
    fn validation_error_message() {
        let err = ValidationError::new("From", "sender is required");
        assert_eq!(err.to_string(), "Invalid From: sender is required");
    }
}
