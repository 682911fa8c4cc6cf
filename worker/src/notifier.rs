//! Notification sender that writes outbound messages to the log.
//!
//! Delivery to an SMS provider is an external integration; this sender stands
//! in for it so the reply path can run end to end.

use hound_core::collaborator::{NotificationSender, NotifyError};

/// [`NotificationSender`] that logs every message at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl NotificationSender for LoggingNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        if recipient.trim().is_empty() {
            return Err(NotifyError::Rejected("recipient is empty".to_string()));
        }
        tracing::info!(recipient, text, "Outbound message");
        Ok(())
    }
}
