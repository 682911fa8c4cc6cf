//! Boundaries to external collaborators.
//!
//! The pipeline depends on two services it does not implement itself: an
//! intent classifier that turns free text into a [`RawClassification`], and a
//! notification sender that delivers reply text to a user.

use crate::command::RawClassification;
use std::future::Future;
use thiserror::Error;

/// Errors from an intent classifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    /// The classifier could not be reached or timed out.
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    /// The classifier rejected the request (bad credentials, bad request).
    #[error("Classifier rejected request: {0}")]
    Rejected(String),

    /// The classifier answered with something that is not a classification.
    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),
}

impl ClassifierError {
    /// Whether retrying the request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Rejected(_) | Self::InvalidResponse(_) => false,
        }
    }
}

/// Natural-language intent classification.
pub trait IntentClassifier: Send + Sync {
    /// Classify a user's message.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifierError`] if the classifier cannot produce an answer.
    fn classify(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<RawClassification, ClassifierError>> + Send;
}

/// Errors from a notification sender.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// Delivery failed but may succeed later.
    #[error("Notification delivery failed: {0}")]
    Unavailable(String),

    /// The recipient or message was refused.
    #[error("Notification rejected: {0}")]
    Rejected(String),
}

impl NotifyError {
    /// Whether retrying delivery may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Rejected(_) => false,
        }
    }
}

/// Outbound message delivery.
pub trait NotificationSender: Send + Sync {
    /// Send `text` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if delivery fails.
    fn send(&self, recipient: &str, text: &str)
    -> impl Future<Output = Result<(), NotifyError>> + Send;
}
