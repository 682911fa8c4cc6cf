//! In-memory durable queue.
//!
//! Behaves like a single broker with prefetch-one consumers:
//!
//! - messages are delivered in publish order
//! - a consumer holding an unsettled delivery gets
//!   [`QueueError::PrefetchExceeded`] from `receive`
//! - `reject(requeue = true)` puts the message back at the head of the queue
//!   with its attempt counter incremented
//! - `fail_next_settles` makes ack and reject fail while the delivery stays
//!   held
//! - dropping a consumer with an unsettled delivery requeues it the same way,
//!   as a broker does when a connection dies mid-message
//!
//! Every publish, ack and drop is recorded so tests can assert on exactly what
//! crossed the queue.

use hound_core::envelope::Envelope;
use hound_core::queue::{Delivery, DurableQueue, QueueConsumer, QueueError};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    attempt: u32,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    published: HashMap<String, Vec<Vec<u8>>>,
    acked: HashMap<String, Vec<Vec<u8>>>,
    dropped: HashMap<String, Vec<Vec<u8>>>,
    requeues: HashMap<String, usize>,
    failing_publishes: HashMap<String, usize>,
    failing_settles: HashMap<String, usize>,
    publish_delay: Option<Duration>,
    next_tag: u64,
    closed: bool,
}

impl State {
    fn requeue(&mut self, queue: &str, mut message: Message) {
        message.attempt += 1;
        *self.requeues.entry(queue.to_string()).or_default() += 1;
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_front(message);
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`DurableQueue`] for tests.
///
/// Cloning yields a handle to the same broker.
///
/// # Example
///
/// ```
/// use hound_testing::InMemoryQueue;
/// use hound_core::queue::DurableQueue;
///
/// # tokio_test::block_on(async {
/// let queue = InMemoryQueue::new();
/// queue.publish("text.commands", b"hello").await.unwrap();
///
/// let mut consumer = queue.consumer("text.commands");
/// let delivery = consumer.next().await.unwrap().unwrap();
/// assert_eq!(delivery.payload, b"hello");
/// assert_eq!(delivery.attempt, 1);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a consumer on `queue` with its concrete type.
    #[must_use]
    pub fn consumer(&self, queue: &str) -> InMemoryConsumer {
        InMemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            in_flight: None,
        }
    }

    /// Close the broker; waiting consumers see the end of their queue.
    pub fn close(&self) {
        self.inner.state().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// Make the next `count` publishes to `queue` fail.
    pub fn fail_next_publishes(&self, queue: &str, count: usize) {
        self.inner
            .state()
            .failing_publishes
            .insert(queue.to_string(), count);
    }

    /// Make the next `count` acks or rejects on `queue` fail transiently.
    ///
    /// A failed settlement leaves the delivery held by its consumer, so it can
    /// be settled again.
    pub fn fail_next_settles(&self, queue: &str, count: usize) {
        self.inner
            .state()
            .failing_settles
            .insert(queue.to_string(), count);
    }

    /// Delay every publish by `delay` before it is accepted.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.inner.state().publish_delay = delay;
    }

    /// Every payload ever accepted on `queue`, in order.
    #[must_use]
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .published
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Every payload ever accepted on `queue`, decoded as `E`.
    ///
    /// Payloads that do not decode are skipped.
    #[must_use]
    pub fn published_envelopes<E: Envelope>(&self, queue: &str) -> Vec<E> {
        self.published(queue)
            .iter()
            .filter_map(|payload| E::decode(payload).ok())
            .collect()
    }

    /// Number of messages waiting on `queue` (not counting one in flight).
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.inner.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Payloads acknowledged on `queue`.
    #[must_use]
    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .acked
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Payloads rejected without requeue on `queue`.
    #[must_use]
    pub fn dropped(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .dropped
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of times a message on `queue` was requeued.
    #[must_use]
    pub fn requeue_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .requeues
            .get(queue)
            .copied()
            .unwrap_or_default()
    }
}

impl DurableQueue for InMemoryQueue {
    fn publish(
        &self,
        queue: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            let delay = self.inner.state().publish_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            {
                let mut state = self.inner.state();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                let remaining = state.failing_publishes.get(&queue).copied().unwrap_or(0);
                if remaining > 0 {
                    state.failing_publishes.insert(queue.clone(), remaining - 1);
                    return Err(QueueError::PublishFailed {
                        queue,
                        reason: "injected failure".to_string(),
                    });
                }
                state
                    .published
                    .entry(queue.clone())
                    .or_default()
                    .push(payload.clone());
                state.queues.entry(queue.clone()).or_default().push_back(Message {
                    payload,
                    attempt: 1,
                });
            }

            tracing::trace!(queue = %queue, "Message published");
            self.inner.notify.notify_waiters();
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn QueueConsumer>, QueueError>> + Send + '_>>
    {
        let consumer = self.consumer(queue);
        Box::pin(async move { Ok(Box::new(consumer) as Box<dyn QueueConsumer>) })
    }
}

/// Prefetch-one consumer of an [`InMemoryQueue`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    inner: Arc<Inner>,
    queue: String,
    in_flight: Option<(u64, Message)>,
}

impl InMemoryConsumer {
    /// Wait for the next delivery; see [`QueueConsumer::receive`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PrefetchExceeded`] if a delivery is unsettled.
    pub async fn next(&mut self) -> Result<Option<Delivery>, QueueError> {
        if self.in_flight.is_some() {
            return Err(QueueError::PrefetchExceeded {
                queue: self.queue.clone(),
            });
        }

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a publish in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state();
                if let Some(message) = state
                    .queues
                    .get_mut(&self.queue)
                    .and_then(VecDeque::pop_front)
                {
                    state.next_tag += 1;
                    let delivery = Delivery {
                        queue: self.queue.clone(),
                        delivery_tag: state.next_tag,
                        payload: message.payload.clone(),
                        attempt: message.attempt,
                    };
                    self.in_flight = Some((state.next_tag, message));
                    return Ok(Some(delivery));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    fn settle(&mut self, delivery: &Delivery) -> Result<Message, QueueError> {
        {
            let mut state = self.inner.state();
            let remaining = state.failing_settles.get(&self.queue).copied().unwrap_or(0);
            if remaining > 0 {
                state.failing_settles.insert(self.queue.clone(), remaining - 1);
                return Err(QueueError::ConsumeFailed("injected settle failure".to_string()));
            }
        }

        let held = self
            .in_flight
            .as_ref()
            .is_some_and(|(tag, _)| *tag == delivery.delivery_tag);
        self.in_flight
            .take_if(|_| held)
            .map(|(_, message)| message)
            .ok_or_else(|| QueueError::UnknownDelivery {
                queue: self.queue.clone(),
                delivery_tag: delivery.delivery_tag,
            })
    }
}

impl QueueConsumer for InMemoryConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn receive(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, QueueError>> + Send + '_>> {
        Box::pin(self.next())
    }

    fn ack(
        &mut self,
        delivery: &Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let result = self.settle(delivery).map(|message| {
            self.inner
                .state()
                .acked
                .entry(self.queue.clone())
                .or_default()
                .push(message.payload);
        });
        Box::pin(async move { result })
    }

    fn reject(
        &mut self,
        delivery: &Delivery,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let result = self.settle(delivery).map(|message| {
            let mut state = self.inner.state();
            if requeue {
                state.requeue(&self.queue, message);
            } else {
                state
                    .dropped
                    .entry(self.queue.clone())
                    .or_default()
                    .push(message.payload);
            }
        });
        if requeue && result.is_ok() {
            self.inner.notify.notify_waiters();
        }
        Box::pin(async move { result })
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if let Some((_, message)) = self.in_flight.take() {
            self.inner.state().requeue(&self.queue, message);
            self.inner.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let queue = InMemoryQueue::new();
        queue.publish("q", b"one").await.unwrap();
        queue.publish("q", b"two").await.unwrap();

        let mut consumer = queue.consumer("q");
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        consumer.ack(&first).await.unwrap();

        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[tokio::test]
    async fn prefetch_is_one() {
        let queue = InMemoryQueue::new();
        queue.publish("q", b"one").await.unwrap();
        queue.publish("q", b"two").await.unwrap();

        let mut consumer = queue.consumer("q");
        let _first = consumer.next().await.unwrap().unwrap();
        assert_eq!(
            consumer.next().await,
            Err(QueueError::PrefetchExceeded {
                queue: "q".to_string()
            })
        );
    }

    #[tokio::test]
    async fn requeue_redelivers_with_next_attempt() {
        let queue = InMemoryQueue::new();
        queue.publish("q", b"one").await.unwrap();
        queue.publish("q", b"two").await.unwrap();

        let mut consumer = queue.consumer("q");
        let first = consumer.next().await.unwrap().unwrap();
        consumer.reject(&first, true).await.unwrap();

        let again = consumer.next().await.unwrap().unwrap();
        assert_eq!(again.payload, b"one");
        assert_eq!(again.attempt, 2);
        assert_ne!(again.delivery_tag, first.delivery_tag);
        assert_eq!(queue.requeue_count("q"), 1);
    }

    #[tokio::test]
    async fn reject_without_requeue_drops() {
        let queue = InMemoryQueue::new();
        queue.publish("q", b"bad").await.unwrap();

        let mut consumer = queue.consumer("q");
        let delivery = consumer.next().await.unwrap().unwrap();
        consumer.reject(&delivery, false).await.unwrap();

        assert_eq!(queue.dropped("q"), vec![b"bad".to_vec()]);
        assert_eq!(queue.pending("q"), 0);
    }

    #[tokio::test]
    async fn settling_unknown_delivery_fails() {
        let queue = InMemoryQueue::new();
        queue.publish("q", b"one").await.unwrap();

        let mut consumer = queue.consumer("q");
        let mut delivery = consumer.next().await.unwrap().unwrap();
        delivery.delivery_tag += 100;

        assert!(matches!(
            consumer.ack(&delivery).await,
            Err(QueueError::UnknownDelivery { .. })
        ));
    }

    #[tokio::test]
    async fn failed_settle_keeps_the_delivery_held() {
        let queue = InMemoryQueue::new();
        queue.publish("q", b"one").await.unwrap();
        queue.fail_next_settles("q", 1);

        let mut consumer = queue.consumer("q");
        let delivery = consumer.next().await.unwrap().unwrap();
        let err = consumer.reject(&delivery, true).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(queue.requeue_count("q"), 0);

        consumer.reject(&delivery, true).await.unwrap();
        assert_eq!(queue.requeue_count("q"), 1);
    }

    #[tokio::test]
    async fn dropping_consumer_requeues_in_flight() {
        let queue = InMemoryQueue::new();
        queue.publish("q", b"one").await.unwrap();

        {
            let mut consumer = queue.consumer("q");
            let _delivery = consumer.next().await.unwrap().unwrap();
        }

        let mut consumer = queue.consumer("q");
        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 2);
    }

    #[tokio::test]
    async fn waiting_receive_wakes_on_publish() {
        let queue = InMemoryQueue::new();
        let mut consumer = queue.consumer("q");

        let publisher = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish("q", b"late").await.unwrap();
        });

        let delivery = consumer.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_ends_waiting_receive() {
        let queue = InMemoryQueue::new();
        let mut consumer = queue.consumer("q");

        let closer = queue.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            closer.close();
        });

        assert_eq!(consumer.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_publish_failures() {
        let queue = InMemoryQueue::new();
        queue.fail_next_publishes("q", 1);

        assert!(matches!(
            queue.publish("q", b"x").await,
            Err(QueueError::PublishFailed { .. })
        ));
        queue.publish("q", b"x").await.unwrap();
        assert_eq!(queue.published("q").len(), 1);
    }
}
