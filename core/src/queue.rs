//! Durable queue abstraction.
//!
//! The pipeline needs three things from a broker:
//!
//! - **Durable publish**: a message accepted by [`DurableQueue::publish`]
//!   survives a broker restart.
//! - **Prefetch of one**: a [`QueueConsumer`] never hands out a second
//!   delivery while the previous one is unsettled, so a single consumer
//!   handles its queue strictly in order.
//! - **Explicit settlement**: every delivery ends in exactly one of
//!   [`ack`](QueueConsumer::ack), `reject(requeue = true)` or
//!   `reject(requeue = false)`.
//!
//! ```text
//!            receive()
//!  queue ───────────────▶ Delivery (attempt = n)
//!    ▲                        │
//!    │   reject(requeue)      ├── ack()            → removed
//!    └────── attempt n+1 ◀────┤
//!                             └── reject(drop)     → removed
//! ```
//!
//! # Implementations
//!
//! - `InMemoryQueue` in `hound-testing` - for tests
//! - `RedpandaQueue` in `hound-redpanda` - for production

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker refused or failed to persist a message
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// The target queue
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker did not confirm a publish within the deadline
    #[error("Publish to queue '{queue}' timed out after {timeout:?}")]
    PublishTimedOut {
        /// The target queue
        queue: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// Receiving from the broker failed
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// A delivery was requested while the previous one is still unsettled
    #[error("Prefetch exceeded on queue '{queue}': previous delivery not settled")]
    PrefetchExceeded {
        /// The queue being consumed
        queue: String,
    },

    /// Settlement was attempted for a delivery this consumer does not hold
    #[error("Unknown delivery {delivery_tag} on queue '{queue}'")]
    UnknownDelivery {
        /// The queue being consumed
        queue: String,
        /// The tag that was not recognized
        delivery_tag: u64,
    },

    /// The queue or connection has been closed
    #[error("Queue closed")]
    Closed,
}

impl QueueError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_)
            | Self::PublishFailed { .. }
            | Self::PublishTimedOut { .. }
            | Self::ConsumeFailed(_)
            | Self::Closed => true,
            Self::PrefetchExceeded { .. } | Self::UnknownDelivery { .. } => false,
        }
    }
}

/// A message handed to a consumer, awaiting settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message came from.
    pub queue: String,
    /// Broker-assigned tag used to settle the delivery.
    pub delivery_tag: u64,
    /// Raw message bytes.
    pub payload: Vec<u8>,
    /// Delivery attempt, starting at 1 and incremented on each requeue.
    pub attempt: u32,
}

/// A broker that provides durable queues.
///
/// Queue names are plain strings; publishing to a queue that does not yet
/// exist declares it.
///
/// # Thread Safety
///
/// Implementations are `Send + Sync` and shared behind an `Arc` by the
/// producer and every consumer in the process.
pub trait DurableQueue: Send + Sync {
    /// Persist `payload` on `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] or [`QueueError::PublishTimedOut`]
    /// if the broker does not confirm the message.
    fn publish(
        &self,
        queue: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Open a prefetch-one consumer on `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the consumer cannot be created.
    #[allow(clippy::type_complexity)] // Boxed future of a boxed consumer
    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn QueueConsumer>, QueueError>> + Send + '_>>;
}

/// A prefetch-one consumer of a single queue.
pub trait QueueConsumer: Send {
    /// The queue this consumer reads.
    fn queue(&self) -> &str;

    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` once the queue is closed. The returned future is
    /// cancel-safe: dropping it before completion loses no message.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PrefetchExceeded`] if the previous delivery has
    /// not been settled, or a transport error.
    fn receive(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, QueueError>> + Send + '_>>;

    /// Remove the delivery permanently.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownDelivery`] if the delivery is not held by
    /// this consumer, or a transport error.
    fn ack(
        &mut self,
        delivery: &Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Settle the delivery negatively.
    ///
    /// With `requeue = true` the message is delivered again with its attempt
    /// counter incremented; with `requeue = false` it is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownDelivery`] if the delivery is not held by
    /// this consumer, or a transport error.
    fn reject(
        &mut self,
        delivery: &Delivery,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;
}
