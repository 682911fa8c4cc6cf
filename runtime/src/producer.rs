//! Command producer.
//!
//! Turns a validated inbound event into exactly one command envelope and
//! publishes it with a bounded deadline. The producer never touches the domain
//! store; a rejected event is reported to the caller and nothing is enqueued.

use crate::metrics;
use hound_core::envelope::{CommandEnvelope, EnvelopeError, MediaEnvelope, TextEnvelope};
use hound_core::error::ValidationError;
use hound_core::idempotency::generate_key;
use hound_core::queue::{DurableQueue, QueueError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default publish deadline.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// An inbound message event after transport-level checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundEvent {
    /// Sender identity (phone number).
    pub sender: String,
    /// Message text, if any.
    pub body: Option<String>,
    /// First media attachment, if any.
    pub media_url: Option<String>,
    /// Number of media attachments, as reported by the trigger source.
    pub num_media: Option<String>,
    /// Id assigned to the event by the trigger source.
    pub external_id: String,
}

impl InboundEvent {
    fn has_media(&self) -> bool {
        let url = self.media_url.as_deref().map(str::trim).unwrap_or_default();
        let count = self.num_media.as_deref().map(str::trim).unwrap_or_default();
        !url.is_empty() && !count.is_empty() && count != "0"
    }
}

/// Build the envelope for `event`.
///
/// Media wins over text: an event with both a media attachment and a body
/// becomes a media command and its body is discarded.
///
/// # Errors
///
/// Returns [`ValidationError`] if the sender or event id is missing, or the
/// event carries neither media nor text.
pub fn classify(event: &InboundEvent) -> Result<CommandEnvelope, ValidationError> {
    let sender = event.sender.trim();
    if sender.is_empty() {
        return Err(ValidationError::new("sender", "is required"));
    }
    let external_id = event.external_id.trim();
    if external_id.is_empty() {
        return Err(ValidationError::new("external_id", "is required"));
    }
    let idempotency_key = generate_key(external_id);

    if event.has_media() {
        let media_url = event.media_url.as_deref().unwrap_or_default().trim();
        return Ok(CommandEnvelope::Media(MediaEnvelope {
            user_id: sender.to_string(),
            media_url: media_url.to_string(),
            external_id: external_id.to_string(),
            idempotency_key,
        }));
    }

    match event.body.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Ok(CommandEnvelope::Text(TextEnvelope {
            user_id: sender.to_string(),
            command_text: text.to_string(),
            external_id: external_id.to_string(),
            idempotency_key,
        })),
        Some(_) | None => Err(ValidationError::new(
            "body",
            "message must contain text or media",
        )),
    }
}

/// Errors from [`CommandProducer::submit`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProducerError {
    /// The event was rejected and nothing was enqueued.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    /// The broker did not accept the envelope.
    #[error(transparent)]
    Publish(#[from] QueueError),
}

impl ProducerError {
    /// HTTP status code to answer the trigger source with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Encode(_) => 500,
            Self::Publish(_) => 503,
        }
    }

    /// Short machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Encode(_) => "encode_error",
            Self::Publish(_) => "queue_unavailable",
        }
    }
}

/// Publish `payload` to `queue`, failing if the broker does not confirm it
/// within `timeout`.
///
/// # Errors
///
/// Returns the broker's [`QueueError`], or [`QueueError::PublishTimedOut`].
pub async fn publish_with_deadline(
    queue: &dyn DurableQueue,
    name: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), QueueError> {
    match tokio::time::timeout(timeout, queue.publish(name, payload)).await {
        Ok(Ok(())) => {
            metrics::record_published(name);
            Ok(())
        }
        Ok(Err(error)) => Err(error),
        Err(_elapsed) => Err(QueueError::PublishTimedOut {
            queue: name.to_string(),
            timeout,
        }),
    }
}

/// Publishes command envelopes for inbound events.
#[derive(Clone)]
pub struct CommandProducer {
    queue: Arc<dyn DurableQueue>,
    timeout: Duration,
}

impl CommandProducer {
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

    /// Validate `event`, publish its envelope and return it.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::Validation`] without publishing if the event
    /// is invalid, or [`ProducerError::Publish`] if the broker does not
    /// confirm the envelope in time.
    pub async fn submit(&self, event: &InboundEvent) -> Result<CommandEnvelope, ProducerError> {
        let envelope = classify(event).inspect_err(|error| {
            tracing::warn!(external_id = %event.external_id, error = %error, "Rejected inbound event");
        })?;
        let payload = envelope.encode()?;

        publish_with_deadline(self.queue.as_ref(), envelope.queue(), &payload, self.timeout)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    queue = envelope.queue(),
                    idempotency_key = %envelope.idempotency_key(),
                    error = %error,
                    "Failed to publish command"
                );
            })?;

        tracing::info!(
            queue = envelope.queue(),
            user_id = envelope.user_id(),
            idempotency_key = %envelope.idempotency_key(),
            "Command enqueued"
        );
        Ok(envelope)
    }
}
