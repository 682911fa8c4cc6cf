//! Wiring of the two pipeline workers.
//!
//! ```text
//!  text.commands ──▶ command worker ──▶ sms.replies ──▶ reply worker ──▶ notifier
//! ```

use hound_core::collaborator::{IntentClassifier, NotificationSender};
use hound_core::envelope::{MEDIA_QUEUE, REPLIES_QUEUE, TEXT_COMMANDS_QUEUE, dead_letter_queue};
use hound_core::queue::DurableQueue;
use hound_core::store::TodoRepository;
use hound_runtime::{
    CommandConsumer, CommandDispatcher, DomainStore, ReplyHandler, ReplyProducer, RetryPolicy,
    TextCommandHandler,
};
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by both workers.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Redelivery policy for failed handlers.
    pub policy: RetryPolicy,
    /// Deadline for publishing replies.
    pub publish_timeout: Duration,
}

/// The consumer of `text.commands`.
pub type CommandWorker<C, R> = CommandConsumer<TextCommandHandler<C, R>>;

/// The consumer of `sms.replies`.
pub type ReplyWorker<N> = CommandConsumer<ReplyHandler<N>>;

/// Every queue the service publishes to or consumes from.
#[must_use]
pub fn queues() -> Vec<String> {
    vec![
        TEXT_COMMANDS_QUEUE.to_string(),
        MEDIA_QUEUE.to_string(),
        REPLIES_QUEUE.to_string(),
        dead_letter_queue(TEXT_COMMANDS_QUEUE),
        dead_letter_queue(REPLIES_QUEUE),
    ]
}

/// Build the worker that classifies and executes text commands.
pub fn command_worker<C, R>(
    queue: Arc<dyn DurableQueue>,
    store: DomainStore<R>,
    classifier: C,
    settings: &PipelineSettings,
) -> CommandWorker<C, R>
where
    C: IntentClassifier,
    R: TodoRepository,
{
    let replies = ReplyProducer::with_timeout(Arc::clone(&queue), settings.publish_timeout);
    let handler = TextCommandHandler::new(classifier, CommandDispatcher::new(store), replies);
    CommandConsumer::new(queue, handler, settings.policy.clone())
}

/// Build the worker that delivers replies.
pub fn reply_worker<N>(
    queue: Arc<dyn DurableQueue>,
    notifier: N,
    settings: &PipelineSettings,
) -> ReplyWorker<N>
where
    N: NotificationSender,
{
    CommandConsumer::new(queue, ReplyHandler::new(notifier), settings.policy.clone())
}
