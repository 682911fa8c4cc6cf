//! Redpanda-backed durable queue for Hound.
//!
//! This crate implements [`DurableQueue`] on top of rdkafka, so any
//! Kafka-compatible broker (Redpanda, Apache Kafka, MSK) can carry the
//! pipeline's queues. Each queue is one topic.
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - A delivery's offset is committed only when it is settled
//! - If the process crashes before settlement, the message is redelivered
//! - A consumer holds at most one unsettled delivery (prefetch of one)
//!
//! Kafka has no native negative acknowledgement, so `reject(requeue = true)`
//! republishes the payload to the tail of the same topic with its
//! `x-attempt` header incremented and then commits the original offset.
//! `reject(requeue = false)` only commits. A settlement whose republish or
//! commit fails leaves the delivery held, so the caller can settle it again;
//! a requeue retried after a failed commit may republish the payload twice.
//!
//! # Example
//!
//! ```no_run
//! use hound_core::queue::DurableQueue;
//! use hound_redpanda::RedpandaQueue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaQueue::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("hound")
//!     .build()?;
//! queue.declare(&["text.commands", "sms.replies"]).await?;
//!
//! queue.publish("text.commands", br#"{"kind":"text"}"#).await?;
//!
//! let mut consumer = queue.consume("text.commands").await?;
//! if let Some(delivery) = consumer.receive().await? {
//!     consumer.ack(&delivery).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use hound_core::queue::{Delivery, DurableQueue, QueueConsumer, QueueError};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Message header carrying the delivery attempt of a requeued message.
pub const ATTEMPT_HEADER: &str = "x-attempt";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONSUMER_GROUP: &str = "hound";

/// [`DurableQueue`] backed by Redpanda topics.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks (default `all`), compression, timeout
/// - **Consumer group**: Prefix for the per-queue consumer group (default `hound`)
/// - **Offset reset**: Where a new group starts reading (default `earliest`)
/// - **Topic layout**: Partitions and replication used by [`declare`](Self::declare)
///
/// # Example
///
/// ```no_run
/// use hound_redpanda::RedpandaQueue;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = RedpandaQueue::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaQueue {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: String,
    auto_offset_reset: String,
    partitions: i32,
    replication: i32,
}

impl RedpandaQueue {
    /// Create a queue with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the queue.
    #[must_use]
    pub fn builder() -> RedpandaQueueBuilder {
        RedpandaQueueBuilder::default()
    }

    /// The bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Create the topics backing `queues`.
    ///
    /// Topics that already exist are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the admin client cannot be
    /// created or the broker rejects a topic for any other reason.
    pub async fn declare(&self, queues: &[&str]) -> Result<(), QueueError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|e| QueueError::ConnectionFailed(format!("Failed to create admin client: {e}")))?;

        let topics: Vec<NewTopic<'_>> = queues
            .iter()
            .map(|queue| {
                NewTopic::new(queue, self.partitions, TopicReplication::Fixed(self.replication))
            })
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(self.timeout));

        let results = admin
            .create_topics(&topics, &options)
            .await
            .map_err(|e| QueueError::ConnectionFailed(format!("Failed to create topics: {e}")))?;

        for result in results {
            match result {
                Ok(topic) => tracing::info!(topic = %topic, "Topic created"),
                Err((topic, code)) if code == RDKafkaErrorCode::TopicAlreadyExists => {
                    tracing::debug!(topic = %topic, "Topic already exists");
                },
                Err((topic, code)) => {
                    return Err(QueueError::ConnectionFailed(format!(
                        "Failed to create topic '{topic}': {code}"
                    )));
                },
            }
        }
        Ok(())
    }
}

/// Builder for configuring a [`RedpandaQueue`].
#[derive(Default)]
pub struct RedpandaQueueBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    partitions: Option<i32>,
    replication: Option<i32>,
}

impl RedpandaQueueBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`. Anything weaker gives up durable publish.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the publish confirmation timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group prefix.
    ///
    /// Each queue is consumed by the group `{prefix}.{queue}`, so every
    /// instance of the service shares the work on a queue.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a new consumer group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the partition count for declared topics.
    ///
    /// Default: 1, which keeps each queue strictly ordered.
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Set the replication factor for declared topics.
    ///
    /// Default: 1
    #[must_use]
    pub const fn replication(mut self, replication: i32) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Build the [`RedpandaQueue`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaQueue, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", compression)
            .create()
            .map_err(|e| QueueError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            consumer_group = %consumer_group,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaQueue created"
        );

        Ok(RedpandaQueue {
            producer,
            brokers,
            timeout,
            consumer_group,
            auto_offset_reset,
            partitions: self.partitions.unwrap_or(1),
            replication: self.replication.unwrap_or(1),
        })
    }
}

/// Read a delivery attempt from a header value. Missing or garbled values count as the first attempt.
fn parse_attempt(value: Option<&[u8]>) -> u32 {
    value
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .and_then(|text| text.trim().parse::<u32>().ok())
        .filter(|attempt| *attempt >= 1)
        .unwrap_or(1)
}

fn attempt_headers(attempt: u32) -> OwnedHeaders {
    let value = attempt.to_string();
    OwnedHeaders::new().insert(Header {
        key: ATTEMPT_HEADER,
        value: Some(value.as_str()),
    })
}

/// Publish `payload`, tagging it with `attempt` when it is a redelivery.
async fn send(
    producer: &FutureProducer,
    queue: &str,
    payload: &[u8],
    attempt: Option<u32>,
    timeout: Duration,
) -> Result<(), QueueError> {
    let mut record = FutureRecord::<(), [u8]>::to(queue).payload(payload);
    if let Some(attempt) = attempt {
        record = record.headers(attempt_headers(attempt));
    }

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            tracing::debug!(queue, partition, offset, attempt = attempt.unwrap_or(1), "Message published");
            Ok(())
        },
        Err((kafka_error, _)) => {
            tracing::error!(queue, error = %kafka_error, "Failed to publish message");
            Err(publish_error(queue, &kafka_error, timeout))
        },
    }
}

fn publish_error(queue: &str, error: &KafkaError, timeout: Duration) -> QueueError {
    if error.rdkafka_error_code() == Some(RDKafkaErrorCode::MessageTimedOut) {
        QueueError::PublishTimedOut {
            queue: queue.to_string(),
            timeout,
        }
    } else {
        QueueError::PublishFailed {
            queue: queue.to_string(),
            reason: error.to_string(),
        }
    }
}

impl DurableQueue for RedpandaQueue {
    fn publish(
        &self,
        queue: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let payload = payload.to_vec();

        Box::pin(async move { send(&self.producer, &queue, &payload, None, self.timeout).await })
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn QueueConsumer>, QueueError>> + Send + '_>>
    {
        let queue = queue.to_string();

        Box::pin(async move {
            let group_id = format!("{}.{queue}", self.consumer_group);
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| {
                    QueueError::ConnectionFailed(format!("Failed to create consumer: {e}"))
                })?;

            consumer.subscribe(&[queue.as_str()]).map_err(|e| {
                QueueError::ConnectionFailed(format!("Failed to subscribe to '{queue}': {e}"))
            })?;

            tracing::info!(queue = %queue, group_id = %group_id, "Consumer subscribed");

            let consumer: Box<dyn QueueConsumer> = Box::new(RedpandaConsumer {
                consumer,
                producer: self.producer.clone(),
                queue,
                timeout: self.timeout,
                in_flight: None,
                next_tag: 1,
            });
            Ok(consumer)
        })
    }
}

/// The delivery a [`RedpandaConsumer`] currently holds.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    delivery_tag: u64,
    partition: i32,
    offset: i64,
}

/// Prefetch-one consumer of a single Redpanda topic.
pub struct RedpandaConsumer {
    consumer: StreamConsumer,
    producer: FutureProducer,
    queue: String,
    timeout: Duration,
    in_flight: Option<InFlight>,
    next_tag: u64,
}

impl RedpandaConsumer {
    /// Release the held delivery if `delivery` is it.
    fn settle(&mut self, delivery: &Delivery) -> Result<InFlight, QueueError> {
        self.in_flight
            .take_if(|held| held.delivery_tag == delivery.delivery_tag)
            .ok_or_else(|| QueueError::UnknownDelivery {
                queue: self.queue.clone(),
                delivery_tag: delivery.delivery_tag,
            })
    }

    /// Commit past `held`. On failure the delivery stays held so it can be
    /// settled again.
    fn commit(&mut self, held: InFlight) -> Result<(), QueueError> {
        let mut offsets = TopicPartitionList::new();
        let committed = offsets
            .add_partition_offset(&self.queue, held.partition, Offset::Offset(held.offset + 1))
            .map_err(|e| QueueError::ConsumeFailed(format!("Invalid offset: {e}")))
            .and_then(|()| {
                self.consumer
                    .commit(&offsets, CommitMode::Async)
                    .map_err(|e| QueueError::ConsumeFailed(format!("Failed to commit offset: {e}")))
            });

        if committed.is_err() {
            self.in_flight = Some(held);
        }
        committed
    }
}

impl QueueConsumer for RedpandaConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn receive(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>, QueueError>> + Send + '_>> {
        Box::pin(async move {
            if self.in_flight.is_some() {
                return Err(QueueError::PrefetchExceeded {
                    queue: self.queue.clone(),
                });
            }

            let (payload, partition, offset, attempt) = {
                let message = self
                    .consumer
                    .recv()
                    .await
                    .map_err(|e| QueueError::ConsumeFailed(e.to_string()))?;
                let attempt = parse_attempt(message.headers().and_then(|headers| {
                    headers
                        .iter()
                        .find(|header| header.key == ATTEMPT_HEADER)
                        .and_then(|header| header.value)
                }));
                (
                    message.payload().unwrap_or_default().to_vec(),
                    message.partition(),
                    message.offset(),
                    attempt,
                )
            };

            let delivery_tag = self.next_tag;
            self.next_tag += 1;
            self.in_flight = Some(InFlight {
                delivery_tag,
                partition,
                offset,
            });

            tracing::trace!(queue = %self.queue, partition, offset, attempt, "Message received");

            Ok(Some(Delivery {
                queue: self.queue.clone(),
                delivery_tag,
                payload,
                attempt,
            }))
        })
    }

    fn ack(
        &mut self,
        delivery: &Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let held = self.settle(delivery);
        Box::pin(async move { self.commit(held?) })
    }

    fn reject(
        &mut self,
        delivery: &Delivery,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let held = self.settle(delivery);
        let payload = delivery.payload.clone();
        let next_attempt = delivery.attempt.saturating_add(1);

        Box::pin(async move {
            let held = held?;
            if requeue {
                if let Err(e) =
                    send(&self.producer, &self.queue, &payload, Some(next_attempt), self.timeout).await
                {
                    self.in_flight = Some(held);
                    return Err(e);
                }
            }
            self.commit(held)
        })
    }
}
