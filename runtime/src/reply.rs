//! Reply channel.
//!
//! Replies travel over their own queue, so a slow or failing notification
//! vendor never holds up command handling. The reply worker is a
//! [`CommandConsumer`](crate::consumer::CommandConsumer) running a
//! [`ReplyHandler`].

use crate::handler::{HandlerError, MessageHandler};
use crate::producer::{DEFAULT_PUBLISH_TIMEOUT, publish_with_deadline};
use hound_core::collaborator::NotificationSender;
use hound_core::envelope::{Envelope, ReplyEnvelope};
use hound_core::queue::DurableQueue;
use std::sync::Arc;
use std::time::Duration;

/// Publishes [`ReplyEnvelope`]s.
#[derive(Clone)]
pub struct ReplyProducer {
    queue: Arc<dyn DurableQueue>,
    timeout: Duration,
}

impl ReplyProducer {
    /// Create a producer with the default publish deadline.
    #[must_use]
    pub fn new(queue: Arc<dyn DurableQueue>) -> Self {
        Self::with_timeout(queue, DEFAULT_PUBLISH_TIMEOUT)
    }

    /// Create a producer with a custom publish deadline.
    #[must_use]
    pub fn with_timeout(queue: Arc<dyn DurableQueue>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    /// Queue `message` for delivery to `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Publish`] if the broker does not confirm the
    /// reply in time.
    pub async fn send(&self, user_id: &str, message: &str) -> Result<(), HandlerError> {
        let payload = ReplyEnvelope {
            user_id: user_id.to_string(),
            message: message.to_string(),
        }
        .encode()?;
        publish_with_deadline(self.queue.as_ref(), ReplyEnvelope::QUEUE, &payload, self.timeout)
            .await?;
        tracing::debug!(user_id, "Reply queued");
        Ok(())
    }
}

/// Delivers queued replies through a [`NotificationSender`].
pub struct ReplyHandler<N> {
    notifier: N,
}

impl<N: NotificationSender> ReplyHandler<N> {
    /// Create a handler delivering through `notifier`.
    #[must_use]
    pub const fn new(notifier: N) -> Self {
        Self { notifier }
    }
}

impl<N: NotificationSender> MessageHandler for ReplyHandler<N> {
    type Message = ReplyEnvelope;

    async fn handle(&self, message: &ReplyEnvelope) -> Result<(), HandlerError> {
        self.notifier.send(&message.user_id, &message.message).await?;
        tracing::info!(user_id = %message.user_id, "Reply delivered");
        Ok(())
    }

    async fn on_exhausted(&self, message: &ReplyEnvelope, error: &HandlerError) {
        tracing::error!(
            user_id = %message.user_id,
            error = %error,
            "Reply could not be delivered"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use hound_core::collaborator::NotifyError;
    use hound_core::envelope::REPLIES_QUEUE;
    use hound_testing::{InMemoryQueue, RecordingNotifier};

    #[tokio::test]
    async fn reply_is_published_as_flat_envelope() {
        let queue = InMemoryQueue::new();
        let replies = ReplyProducer::new(Arc::new(queue.clone()));

        replies.send("+15550001111", "Added #1: buy milk").await.unwrap();

        let payload = &queue.published(REPLIES_QUEUE)[0];
        let value: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"user_id": "+15550001111", "message": "Added #1: buy milk"})
        );
    }

    #[tokio::test]
    async fn handler_forwards_to_notifier() {
        let notifier = RecordingNotifier::new();
        let handler = ReplyHandler::new(notifier.clone());

        handler
            .handle(&ReplyEnvelope {
                user_id: "+1".to_string(),
                message: "hi".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(notifier.sent()[0].text, "hi");
    }

    #[tokio::test]
    async fn vendor_rejection_is_permanent() {
        let notifier = RecordingNotifier::new();
        notifier.fail_next(NotifyError::Rejected("invalid number".to_string()));
        let handler = ReplyHandler::new(notifier);

        let err = handler
            .handle(&ReplyEnvelope {
                user_id: "+1".to_string(),
                message: "hi".to_string(),
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
