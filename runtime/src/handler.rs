//! Message handlers.
//!
//! A [`MessageHandler`] is what a [`CommandConsumer`](crate::consumer::CommandConsumer)
//! runs for each decoded envelope. Handlers must tolerate being invoked more
//! than once for the same envelope: a failure after a side effect leads to a
//! redelivery, so every side effect is keyed or naturally repeatable.
//!
//! [`TextCommandHandler`] records the reply to a mutating command under the
//! envelope's key. A redelivery publishes that reply again without asking the
//! classifier, so it repeats the first answer byte for byte even when the
//! command would now be classified differently.

use crate::dispatcher::CommandDispatcher;
use crate::reply::ReplyProducer;
use hound_core::collaborator::{ClassifierError, IntentClassifier, NotifyError};
use hound_core::command::ClassifiedCommand;
use hound_core::envelope::{Envelope, EnvelopeError, TextEnvelope};
use hound_core::queue::QueueError;
use hound_core::store::{StoreError, TodoRepository};
use std::future::Future;
use thiserror::Error;

/// Reply sent when a text command could not be carried out at all.
pub const FAILURE_REPLY: &str =
    "Sorry, something went wrong handling your message. Please try again in a moment.";

/// Errors a handler reports to its consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The intent classifier failed.
    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A follow-up message could not be published.
    #[error(transparent)]
    Publish(#[from] QueueError),

    /// A notification could not be delivered.
    #[error(transparent)]
    Notify(#[from] NotifyError),

    /// A follow-up envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] EnvelopeError),
}

impl HandlerError {
    /// Whether redelivering the message may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Classifier(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            Self::Publish(e) => e.is_transient(),
            Self::Notify(e) => e.is_transient(),
            Self::Encode(_) => false,
        }
    }
}

/// Processes one decoded envelope.
pub trait MessageHandler: Send + Sync {
    /// The envelope this handler consumes.
    type Message: Envelope;

    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`]; transient errors lead to a redelivery.
    fn handle(
        &self,
        message: &Self::Message,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Called once when the consumer gives up on `message`.
    fn on_exhausted(
        &self,
        message: &Self::Message,
        error: &HandlerError,
    ) -> impl Future<Output = ()> + Send {
        let _ = (message, error);
        async {}
    }
}

/// Classify, dispatch and reply to text commands.
pub struct TextCommandHandler<C, R> {
    classifier: C,
    dispatcher: CommandDispatcher<R>,
    replies: ReplyProducer,
}

impl<C, R> TextCommandHandler<C, R>
where
    C: IntentClassifier,
    R: TodoRepository,
{
    /// Create a handler.
    #[must_use]
    pub const fn new(classifier: C, dispatcher: CommandDispatcher<R>, replies: ReplyProducer) -> Self {
        Self {
            classifier,
            dispatcher,
            replies,
        }
    }
}

impl<C, R> MessageHandler for TextCommandHandler<C, R>
where
    C: IntentClassifier,
    R: TodoRepository,
{
    type Message = TextEnvelope;

    async fn handle(&self, message: &TextEnvelope) -> Result<(), HandlerError> {
        let store = self.dispatcher.store();
        if let Some(reply) = store.recorded_reply(&message.idempotency_key).await? {
            tracing::info!(
                user_id = %message.user_id,
                idempotency_key = %message.idempotency_key,
                "Replaying recorded reply"
            );
            self.replies.send(&message.user_id, &reply).await?;
            return Ok(());
        }

        let raw = self.classifier.classify(&message.command_text).await?;
        let command = ClassifiedCommand::from(raw);
        tracing::info!(
            user_id = %message.user_id,
            idempotency_key = %message.idempotency_key,
            action = command.intent.name(),
            confidence = command.confidence,
            "Classified command"
        );

        let mut reply = self
            .dispatcher
            .dispatch(&message.user_id, &message.idempotency_key, &command)
            .await?;
        if let Some(note) = command.low_confidence_note() {
            reply = format!("{reply}\n\n(Note: {note})");
        }
        if command.intent.is_mutating() {
            reply = store.record_reply(&message.idempotency_key, reply).await?;
        }

        self.replies.send(&message.user_id, &reply).await?;
        Ok(())
    }

    async fn on_exhausted(&self, message: &TextEnvelope, error: &HandlerError) {
        tracing::error!(
            user_id = %message.user_id,
            idempotency_key = %message.idempotency_key,
            error = %error,
            "Giving up on command"
        );
        if let Err(publish_error) = self.replies.send(&message.user_id, FAILURE_REPLY).await {
            tracing::warn!(
                user_id = %message.user_id,
                error = %publish_error,
                "Failed to publish failure reply"
            );
        }
    }
}
