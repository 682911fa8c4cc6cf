//! Command consumer.
//!
//! One pull loop per queue. Each delivery goes through a small state machine:
//!
//! ```text
//!  Received ──decode──▶ Parsed ──handle──▶ Handled ──────────────▶ ack
//!     │                   │
//!     │ malformed         │ failed
//!     ▼                   ▼
//!  dead-letter copy    RetryPolicy::decide(attempt, transient)
//!  reject(drop)           ├── Requeue { delay } ──▶ backoff, reject(requeue)
//!                         └── Exhausted ──▶ dead-letter, on_exhausted, ack
//! ```
//!
//! The queue's prefetch of one means deliveries are handled strictly one at a
//! time. Shutdown is observed while waiting for the next delivery and during a
//! requeue backoff, never while a handler runs: a message that has been
//! received is settled before [`CommandConsumer::run`] returns.
//!
//! A settlement (ack or reject) that fails transiently is retried with the
//! retry policy's backoff until the broker accepts it. If shutdown arrives
//! while the broker is still failing, `run` returns the error and the
//! unsettled delivery is left to the broker's redelivery.

use crate::handler::{HandlerError, MessageHandler};
use crate::metrics::PipelineMetrics;
use crate::producer::{DEFAULT_PUBLISH_TIMEOUT, publish_with_deadline};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use hound_core::envelope::{Envelope, dead_letter_queue};
use hound_core::queue::{Delivery, DurableQueue, QueueConsumer, QueueError};
use std::sync::Arc;
use std::time::Duration;

/// Wait before retrying a failed receive.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
    Drop,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled and acknowledged.
    Acked,
    /// Handed back to the broker for another attempt.
    Requeued,
    /// Malformed; rejected without requeue.
    Dropped,
    /// Given up on; copied to the dead-letter queue and acknowledged.
    DeadLettered,
}

/// Counts of settled deliveries over one [`CommandConsumer::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries acknowledged after successful handling.
    pub acked: u64,
    /// Deliveries requeued.
    pub requeued: u64,
    /// Malformed deliveries dropped.
    pub dropped: u64,
    /// Deliveries dead-lettered.
    pub dead_lettered: u64,
}

impl ConsumerStats {
    /// Count one settled delivery.
    pub const fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::Dropped => self.dropped += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
        }
    }

    /// Total deliveries settled.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.acked + self.requeued + self.dropped + self.dead_lettered
    }
}

/// Pull loop feeding one queue into a [`MessageHandler`].
pub struct CommandConsumer<H> {
    queue: Arc<dyn DurableQueue>,
    queue_name: String,
    handler: H,
    policy: RetryPolicy,
}

impl<H: MessageHandler> CommandConsumer<H> {
    /// Consume the handler's envelope queue.
    #[must_use]
    pub fn new(queue: Arc<dyn DurableQueue>, handler: H, policy: RetryPolicy) -> Self {
        Self {
            queue,
            queue_name: H::Message::QUEUE.to_string(),
            handler,
            policy,
        }
    }

    /// Queue being consumed.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Process deliveries until shutdown is signalled or the queue closes.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the consumer cannot be opened, receiving
    /// fails permanently, a delivery cannot be settled for a non-transient
    /// reason, or shutdown arrives while a settlement is still failing.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<ConsumerStats, QueueError> {
        let mut consumer = self.queue.consume(&self.queue_name).await?;
        let mut stats = ConsumerStats::default();
        tracing::info!(queue = %self.queue_name, "Consumer started");

        loop {
            let received = tokio::select! {
                biased;
                () = shutdown.wait() => {
                    tracing::info!(queue = %self.queue_name, "Shutdown requested, consumer stopping");
                    break;
                }
                received = consumer.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let outcome = self
                        .process(&mut *consumer, &delivery, &mut shutdown)
                        .await?;
                    stats.record(outcome);
                }
                Ok(None) => {
                    tracing::info!(queue = %self.queue_name, "Queue closed, consumer stopping");
                    break;
                }
                Err(error) if error.is_transient() => {
                    tracing::warn!(queue = %self.queue_name, error = %error, "Receive failed, retrying");
                    tokio::select! {
                        biased;
                        () = shutdown.wait() => break,
                        () = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
                Err(error) => return Err(error),
            }
        }

        tracing::info!(
            queue = %self.queue_name,
            acked = stats.acked,
            requeued = stats.requeued,
            dropped = stats.dropped,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// Decode, handle and settle one delivery.
    async fn process(
        &self,
        consumer: &mut dyn QueueConsumer,
        delivery: &Delivery,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Outcome, QueueError> {
        PipelineMetrics::record_received(&self.queue_name);

        let message = match H::Message::decode(&delivery.payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(
                    queue = %self.queue_name,
                    attempt = delivery.attempt,
                    error = %error,
                    "Malformed message, dropping"
                );
                if let Err(error) = self.dead_letter(delivery).await {
                    tracing::warn!(queue = %self.queue_name, error = %error, "Failed to capture malformed message");
                }
                self.settle(consumer, delivery, Settlement::Drop, shutdown)
                    .await?;
                PipelineMetrics::record_dropped(&self.queue_name);
                return Ok(Outcome::Dropped);
            }
        };

        let Err(error) = self.handler.handle(&message).await else {
            self.settle(consumer, delivery, Settlement::Ack, shutdown)
                .await?;
            PipelineMetrics::record_acked(&self.queue_name);
            return Ok(Outcome::Acked);
        };

        match self.policy.decide(delivery.attempt, error.is_transient()) {
            RetryDecision::Requeue { delay } => {
                tracing::warn!(
                    queue = %self.queue_name,
                    attempt = delivery.attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Handler failed, requeueing"
                );
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        () = shutdown.wait() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                self.requeue(consumer, delivery, shutdown).await
            }
            RetryDecision::Exhausted => {
                self.give_up(consumer, delivery, &message, &error, shutdown)
                    .await
            }
        }
    }

    async fn give_up(
        &self,
        consumer: &mut dyn QueueConsumer,
        delivery: &Delivery,
        message: &H::Message,
        error: &HandlerError,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Outcome, QueueError> {
        tracing::error!(
            queue = %self.queue_name,
            attempt = delivery.attempt,
            transient = error.is_transient(),
            error = %error,
            "Handler failed permanently, dead-lettering"
        );

        if let Err(publish_error) = self.dead_letter(delivery).await {
            // Acking now would lose the message.
            tracing::error!(
                queue = %self.queue_name,
                error = %publish_error,
                "Dead-letter publish failed, requeueing instead"
            );
            return self.requeue(consumer, delivery, shutdown).await;
        }

        self.handler.on_exhausted(message, error).await;
        self.settle(consumer, delivery, Settlement::Ack, shutdown)
            .await?;
        PipelineMetrics::record_dead_lettered(&self.queue_name);
        Ok(Outcome::DeadLettered)
    }

    async fn requeue(
        &self,
        consumer: &mut dyn QueueConsumer,
        delivery: &Delivery,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Outcome, QueueError> {
        self.settle(consumer, delivery, Settlement::Requeue, shutdown)
            .await?;
        PipelineMetrics::record_requeued(&self.queue_name);
        Ok(Outcome::Requeued)
    }

    /// Settle `delivery`, retrying while the broker fails transiently.
    async fn settle(
        &self,
        consumer: &mut dyn QueueConsumer,
        delivery: &Delivery,
        settlement: Settlement,
        shutdown: &mut ShutdownSignal,
    ) -> Result<(), QueueError> {
        let mut failures: u32 = 0;
        loop {
            let result = match settlement {
                Settlement::Ack => consumer.ack(delivery).await,
                Settlement::Requeue => consumer.reject(delivery, true).await,
                Settlement::Drop => consumer.reject(delivery, false).await,
            };
            let error = match result {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() => error,
                Err(error) => return Err(error),
            };

            failures = failures.saturating_add(1);
            let delay = self.policy.delay_for_attempt(failures);
            tracing::warn!(
                queue = %self.queue_name,
                attempt = delivery.attempt,
                settlement = ?settlement,
                failures,
                error = %error,
                "Settling delivery failed, retrying"
            );
            tokio::select! {
                biased;
                () = shutdown.wait() => {
                    tracing::error!(
                        queue = %self.queue_name,
                        error = %error,
                        "Shutdown with an unsettled delivery, leaving it to the broker"
                    );
                    return Err(error);
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let target = dead_letter_queue(&self.queue_name);
        publish_with_deadline(
            self.queue.as_ref(),
            &target,
            &delivery.payload,
            DEFAULT_PUBLISH_TIMEOUT,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic
mod tests {
    use super::*;
    use crate::shutdown::{self, ShutdownTrigger};
    use hound_core::collaborator::NotifyError;
    use hound_core::envelope::{REPLIES_QUEUE, ReplyEnvelope};
    use hound_core::store::StoreError;
    use hound_testing::InMemoryQueue;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedHandler {
        failures: Mutex<VecDeque<HandlerError>>,
        calls: AtomicUsize,
        exhausted: AtomicUsize,
        stop_after_handling: Mutex<Option<ShutdownTrigger>>,
    }

    impl ScriptedHandler {
        fn failing(failures: Vec<HandlerError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MessageHandler for ScriptedHandler {
        type Message = ReplyEnvelope;

        async fn handle(&self, _message: &ReplyEnvelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(trigger) = self.stop_after_handling.lock().unwrap().take() {
                trigger.trigger();
            }
            self.failures.lock().unwrap().pop_front().map_or(Ok(()), Err)
        }

        async fn on_exhausted(&self, _message: &ReplyEnvelope, _error: &HandlerError) {
            self.exhausted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn transient() -> HandlerError {
        HandlerError::Store(StoreError::Database("connection reset".to_string()))
    }

    fn immediate(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::ZERO)
            .max_delay(Duration::ZERO)
            .build()
    }

    async fn publish_reply(queue: &InMemoryQueue) {
        let payload = ReplyEnvelope {
            user_id: "+15550001111".to_string(),
            message: "hello".to_string(),
        }
        .encode()
        .unwrap();
        queue.publish(REPLIES_QUEUE, &payload).await.unwrap();
    }

    /// Run the consumer until the handler has been invoked `calls` times and
    /// the last delivery is settled.
    async fn run_until(consumer: &CommandConsumer<ScriptedHandler>, calls: usize) -> ConsumerStats {
        let (trigger, signal) = shutdown::channel();
        let run = consumer.run(signal);
        tokio::pin!(run);
        let deadline = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(deadline);

        // The queue stays open, so stop the loop once the handler has caught up.
        loop {
            tokio::select! {
                result = &mut run => return result.unwrap(),
                () = &mut deadline => panic!("handler was not invoked {calls} times"),
                () = tokio::time::sleep(Duration::from_millis(5)) => {
                    if consumer.handler().calls() >= calls {
                        trigger.trigger();
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn successful_delivery_is_acked() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::default(),
            immediate(5),
        );

        let stats = run_until(&consumer, 1).await;

        assert_eq!(stats.acked, 1);
        assert_eq!(queue.acked(REPLIES_QUEUE).len(), 1);
        assert_eq!(queue.pending(REPLIES_QUEUE), 0);
    }

    #[tokio::test]
    async fn failed_delivery_is_requeued_and_retried() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::failing(vec![transient()]),
            immediate(5),
        );

        let stats = run_until(&consumer, 2).await;

        assert_eq!(consumer.handler().calls(), 2);
        assert_eq!(queue.requeue_count(REPLIES_QUEUE), 1);
        assert_eq!(stats, ConsumerStats { acked: 1, requeued: 1, ..ConsumerStats::default() });
    }

    #[tokio::test]
    async fn exhausted_delivery_is_dead_lettered() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::failing(vec![transient(), transient(), transient()]),
            immediate(3),
        );

        let stats = run_until(&consumer, 3).await;

        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(consumer.handler().exhausted.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.published(&dead_letter_queue(REPLIES_QUEUE)),
            queue.published(REPLIES_QUEUE)
        );
        assert_eq!(queue.acked(REPLIES_QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        let permanent = HandlerError::Notify(NotifyError::Rejected("invalid number".to_string()));
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::failing(vec![permanent]),
            RetryPolicy::unbounded(),
        );

        let stats = run_until(&consumer, 1).await;

        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(queue.requeue_count(REPLIES_QUEUE), 0);
    }

    #[tokio::test]
    async fn dead_letter_failure_requeues_instead_of_acking() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        queue.fail_next_publishes(&dead_letter_queue(REPLIES_QUEUE), 1);
        let permanent = HandlerError::Notify(NotifyError::Rejected("invalid number".to_string()));
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::failing(vec![permanent]),
            immediate(5),
        );

        let stats = run_until(&consumer, 2).await;

        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(consumer.handler().exhausted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_requeue_is_retried_and_the_loop_keeps_going() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        publish_reply(&queue).await;
        queue.fail_next_settles(REPLIES_QUEUE, 1);
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::failing(vec![transient()]),
            immediate(5),
        );

        let stats = run_until(&consumer, 3).await;

        assert_eq!(consumer.handler().calls(), 3);
        assert_eq!(stats, ConsumerStats { acked: 2, requeued: 1, ..ConsumerStats::default() });
        assert_eq!(queue.requeue_count(REPLIES_QUEUE), 1);
        assert_eq!(queue.pending(REPLIES_QUEUE), 0);
    }

    #[tokio::test]
    async fn failed_ack_is_retried() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        queue.fail_next_settles(REPLIES_QUEUE, 2);
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::default(),
            immediate(5),
        );

        let stats = run_until(&consumer, 1).await;

        assert_eq!(stats.acked, 1);
        assert_eq!(consumer.handler().calls(), 1);
        assert_eq!(queue.acked(REPLIES_QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn shutdown_during_settle_outage_leaves_delivery_to_the_broker() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        queue.fail_next_settles(REPLIES_QUEUE, usize::MAX);
        let (trigger, signal) = shutdown::channel();
        let handler = ScriptedHandler::default();
        *handler.stop_after_handling.lock().unwrap() = Some(trigger);
        let consumer = CommandConsumer::new(Arc::new(queue.clone()), handler, immediate(5));

        let err = consumer.run(signal).await.unwrap_err();

        assert!(err.is_transient());
        assert!(queue.acked(REPLIES_QUEUE).is_empty());
        assert_eq!(queue.pending(REPLIES_QUEUE), 1);
    }

    #[tokio::test]
    async fn in_flight_message_settles_before_shutdown() {
        let queue = InMemoryQueue::new();
        publish_reply(&queue).await;
        publish_reply(&queue).await;
        let (trigger, signal) = shutdown::channel();
        let handler = ScriptedHandler::default();
        *handler.stop_after_handling.lock().unwrap() = Some(trigger);
        let consumer = CommandConsumer::new(Arc::new(queue.clone()), handler, immediate(5));

        let stats = consumer.run(signal).await.unwrap();

        assert_eq!(stats.acked, 1);
        assert_eq!(queue.acked(REPLIES_QUEUE).len(), 1);
        assert_eq!(queue.pending(REPLIES_QUEUE), 1);
    }

    #[tokio::test]
    async fn closed_queue_ends_the_loop() {
        let queue = InMemoryQueue::new();
        queue.close();
        let consumer = CommandConsumer::new(
            Arc::new(queue.clone()),
            ScriptedHandler::default(),
            immediate(5),
        );
        let (_trigger, signal) = shutdown::channel();

        let stats = consumer.run(signal).await.unwrap();
        assert_eq!(stats.total(), 0);
    }
}
