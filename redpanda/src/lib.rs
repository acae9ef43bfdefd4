//! Redpanda message bus for the reliable events bridge.
//!
//! Implements [`MessageBus`] on top of rdkafka, so it works against Redpanda or any
//! Kafka-compatible broker.
//!
//! # Wire format
//!
//! - **value**: the bincode envelope of the [`BusMessage`] (id, type, headers, body)
//! - **key**: the message's partition key (the aggregate id), so all messages of one
//!   aggregate land on one partition and keep their order
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits. Each subscription hands out one
//! [`Delivery`] at a time and waits for it to be settled:
//!
//! - `ack` commits the offset and moves on
//! - `nack` (or dropping the delivery) waits `redelivery_delay`, seeks back to the
//!   message's offset and delivers it again with `attempt + 1`
//!
//! Settling before the next message is read keeps per-partition order intact across
//! retries.
//!
//! # Example
//!
//! ```no_run
//! use reliable_events_redpanda::RedpandaBus;
//! use reliable_events_core::bus::MessageBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("facility-service")
//!     .build()?;
//!
//! let mut deliveries = bus.subscribe(&["bookings.booking"]).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received {}", delivery.message());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use reliable_events_core::bus::{Acknowledger, Delivery, DeliveryStream, MessageBus, TransportError};
use reliable_events_core::config::BusSettings;
use reliable_events_core::message::BusMessage;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Redpanda message bus.
///
/// # Example
///
/// ```no_run
/// use reliable_events_redpanda::RedpandaBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: String,
    auto_offset_reset: String,
    redelivery_delay: Duration,
}

impl RedpandaBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, TransportError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a bus from the bridge's bus settings.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the producer cannot be created.
    pub fn from_settings(settings: &BusSettings) -> Result<Self, TransportError> {
        Self::builder()
            .brokers(settings.brokers.clone())
            .consumer_group(settings.consumer_group.clone())
            .build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaBusBuilder {
        RedpandaBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// The consumer group subscriptions join.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

impl std::fmt::Debug for RedpandaBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBus")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaBus`].
#[derive(Default)]
pub struct RedpandaBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
    redelivery_delay: Option<Duration>,
}

impl RedpandaBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group for subscriptions.
    ///
    /// All receivers of one bounded context share a group so each message is handled
    /// by one instance.
    ///
    /// Default: "integration-bridge"
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a new consumer group starts reading: "earliest" or "latest".
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Pause before a nacked message is delivered again.
    ///
    /// Default: 1 second
    #[must_use]
    pub const fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = Some(delay);
        self
    }

    /// Build the [`RedpandaBus`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaBus, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", if acks == "all" { "true" } else { "false" })
            .set("compression.type", compression)
            .create()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let bus = RedpandaBus {
            producer,
            brokers,
            timeout,
            consumer_group: self
                .consumer_group
                .unwrap_or_else(|| "integration-bridge".to_string()),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "earliest".to_string()),
            redelivery_delay: self.redelivery_delay.unwrap_or(Duration::from_secs(1)),
        };

        tracing::info!(
            brokers = %bus.brokers,
            acks = acks,
            compression = compression,
            consumer_group = %bus.consumer_group,
            auto_offset_reset = %bus.auto_offset_reset,
            "RedpandaBus created"
        );
        Ok(bus)
    }
}

impl MessageBus for RedpandaBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = message.to_envelope().map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: format!("Failed to encode envelope: {e}"),
            })?;

            let record = FutureRecord::to(topic)
                .payload(&payload)
                .key(message.headers.partition_key.as_bytes());

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        message_id = %message.message_id,
                        event_type = %message.event_type,
                        "Message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        message_id = %message.message_id,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(TransportError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| TransportError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| TransportError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %self.consumer_group,
                "Subscribed to topics"
            );

            // Capacity 1: the consumer task waits for each delivery to be settled anyway.
            let (tx, mut rx) = mpsc::channel(1);
            tokio::spawn(consume(consumer, tx, self.redelivery_delay, self.timeout));

            let deliveries = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(deliveries) as DeliveryStream)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack,
}

struct KafkaAcker {
    settle: oneshot::Sender<Settlement>,
}

impl KafkaAcker {
    fn settle(self, settlement: Settlement) -> Result<(), TransportError> {
        self.settle
            .send(settlement)
            .map_err(|_| TransportError::AcknowledgeFailed("consumer task stopped".to_string()))
    }
}

impl Acknowledger for KafkaAcker {
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>> {
        let result = self.settle(Settlement::Ack);
        Box::pin(async move { result })
    }

    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>> {
        let result = self.settle(Settlement::Nack);
        Box::pin(async move { result })
    }
}

/// Redelivery count per `(topic, partition, offset)`.
#[derive(Debug, Default)]
struct AttemptTracker {
    attempts: HashMap<(String, i32, i64), u32>,
}

impl AttemptTracker {
    fn next(&mut self, topic: &str, partition: i32, offset: i64) -> u32 {
        let attempt = self
            .attempts
            .entry((topic.to_string(), partition, offset))
            .or_insert(0);
        *attempt = attempt.saturating_add(1);
        *attempt
    }

    fn settled(&mut self, topic: &str, partition: i32, offset: i64) {
        self.attempts.remove(&(topic.to_string(), partition, offset));
    }
}

/// Owns the consumer; forwards one delivery at a time and applies its settlement.
async fn consume(
    consumer: StreamConsumer,
    tx: mpsc::Sender<Result<Delivery, TransportError>>,
    redelivery_delay: Duration,
    seek_timeout: Duration,
) {
    let mut tracker = AttemptTracker::default();
    let mut stream = consumer.stream();

    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                let err = TransportError::ConnectionFailed(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let (topic, partition, offset) = (message.topic().to_string(), message.partition(), message.offset());

        let decoded = message
            .payload()
            .ok_or_else(|| TransportError::InvalidEnvelope("message has no payload".to_string()))
            .and_then(|payload| {
                BusMessage::from_envelope(payload)
                    .map_err(|e| TransportError::InvalidEnvelope(e.to_string()))
            });

        let bus_message = match decoded {
            Ok(bus_message) => bus_message,
            Err(err) => {
                // Without an envelope there is no message id to dead-letter under.
                tracing::error!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    error = %err,
                    "Skipping undecodable record"
                );
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(error = %e, "Failed to commit skipped record");
                }
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let attempt = tracker.next(&topic, partition, offset);
        let (settle_tx, settle_rx) = oneshot::channel();
        let delivery = Delivery::new(
            topic.clone(),
            bus_message,
            attempt,
            Box::new(KafkaAcker { settle: settle_tx }),
        );

        if tx.send(Ok(delivery)).await.is_err() {
            tracing::debug!("Subscriber dropped, exiting consumer task");
            break;
        }

        // A dropped delivery counts as a nack.
        let settlement = settle_rx.await.unwrap_or(Settlement::Nack);
        match settlement {
            Settlement::Ack => {
                tracker.settled(&topic, partition, offset);
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        error = %e,
                        "Failed to commit offset (message may be redelivered)"
                    );
                }
            }
            Settlement::Nack => {
                tracing::debug!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    attempt = attempt,
                    "Message nacked, scheduling redelivery"
                );
                tokio::time::sleep(redelivery_delay).await;
                if let Err(e) = rewind(&consumer, &topic, partition, offset, seek_timeout) {
                    tracing::error!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        error = %e,
                        "Failed to rewind; message will be redelivered after a rebalance"
                    );
                }
            }
        }
    }

    tracing::debug!("Consumer task exiting");
}

fn rewind(
    consumer: &StreamConsumer,
    topic: &str,
    partition: i32,
    offset: i64,
    timeout: Duration,
) -> Result<(), TransportError> {
    let mut position = TopicPartitionList::new();
    position
        .add_partition_offset(topic, partition, Offset::Offset(offset))
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    consumer
        .seek_partitions(position, Timeout::After(timeout))
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(())
}
