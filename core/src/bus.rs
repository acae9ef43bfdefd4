//! Message bus abstraction.
//!
//! The bus is an at-least-once transport. Consumers receive [`Delivery`] values and must
//! settle each one explicitly:
//!
//! - `ack` - the message is done (processed, duplicate, or dead-lettered)
//! - `nack` - the message should be delivered again
//!
//! Dropping a delivery without settling it leaves redelivery to the transport (e.g. a
//! Kafka consumer re-reads uncommitted offsets after a rebalance).
//!
//! # Topic Naming Convention
//!
//! Logical topics from the outbound registry are prefixed with the bounded-context
//! namespace through [`TopicNaming`](crate::config::TopicNaming):
//! `booking` → `bookings.booking`.
//!
//! # Implementations
//!
//! - `InMemoryBus` (testing crate) - deterministic, with failure injection
//! - `RedpandaBus` (redpanda crate) - Kafka-compatible, for production

use crate::message::BusMessage;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A record on the bus is not a valid message envelope
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Failed to acknowledge or negatively acknowledge a delivery
    #[error("Acknowledge failed: {0}")]
    AcknowledgeFailed(String),

    /// The bus is shutting down or the subscription ended
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// Settles a single delivery with the transport.
///
/// Both operations consume the acknowledger: a delivery is settled exactly once.
pub trait Acknowledger: Send + Sync {
    /// Confirm the delivery; the transport will not deliver it to this consumer again.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AcknowledgeFailed`] if the transport rejects the commit.
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

    /// Reject the delivery; the transport will deliver it again.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AcknowledgeFailed`] if the transport cannot rewind.
    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;
}

/// A message handed to a consumer, together with the means to settle it.
pub struct Delivery {
    topic: String,
    message: BusMessage,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery.
    ///
    /// `attempt` is 1 for the first delivery of this message to this consumer.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        message: BusMessage,
        attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            topic: topic.into(),
            message,
            attempt,
            acker,
        }
    }

    /// Topic the message arrived on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &BusMessage {
        &self.message
    }

    /// How many times this message has been delivered, including this one.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AcknowledgeFailed`] if the transport rejects it.
    pub async fn ack(self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Request redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AcknowledgeFailed`] if the transport rejects it.
    pub async fn nack(self) -> Result<(), TransportError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("message", &self.message)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;

/// Trait for message bus implementations.
///
/// # Design Principles
///
/// - **At-least-once**: every published message is delivered one or more times
/// - **Ordered within partition**: messages sharing a `partition_key` keep their order
/// - **Explicit settlement**: nothing is considered consumed until acknowledged
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so publishers and receivers can hold an `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// Returns once the broker has accepted the message.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the broker rejects or times out.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Subscribe to one or more topics.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionFailed`] if the subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>>;
}
