//! In-memory message bus.
//!
//! Every subscription gets its own unbounded queue. A nacked delivery is put back at the
//! end of that queue with its attempt counter incremented, so redelivery is observable
//! but ordering after a nack is not preserved (a Kafka consumer would rewind instead).
//!
//! Publishing completes without suspending unless a latency is configured with
//! [`InMemoryBus::set_publish_latency`]; then every publish moves a [`ManualClock`]
//! forward and yields to the scheduler, so concurrent dispatchers interleave mid-batch.

use crate::clock::ManualClock;
use async_stream::stream;
use reliable_events_core::bus::{
    Acknowledger, Delivery, DeliveryStream, MessageBus, TransportError,
};
use reliable_events_core::message::BusMessage;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
struct Queued {
    topic: String,
    message: BusMessage,
    attempt: u32,
}

#[derive(Debug)]
struct Subscriber {
    topics: HashSet<String>,
    sender: mpsc::UnboundedSender<Queued>,
}

#[derive(Debug, Clone)]
struct PublishLatency {
    clock: ManualClock,
    per_publish: chrono::Duration,
}

#[derive(Debug, Default)]
struct BusState {
    latency: Option<PublishLatency>,
    published: Vec<(String, BusMessage)>,
    subscribers: Vec<Subscriber>,
    failing_publishes: u32,
    unavailable: bool,
    acks: usize,
    nacks: usize,
}

/// In-memory [`MessageBus`] with failure injection.
///
/// Clones share the same bus.
///
/// # Example
///
/// ```
/// use reliable_events_testing::InMemoryBus;
/// use reliable_events_core::bus::MessageBus;
/// use reliable_events_core::message::{BusMessage, MessageHeaders, MessageId};
/// use futures::StreamExt;
/// use chrono::Utc;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryBus::new();
/// let mut deliveries = bus.subscribe(&["bookings.booking"]).await.unwrap();
///
/// let message = BusMessage::new(
///     MessageId::random(),
///     "BookingCreated",
///     vec![],
///     MessageHeaders::new("B1", Utc::now()),
/// );
/// bus.publish("bookings.booking", &message).await.unwrap();
///
/// let delivery = deliveries.next().await.unwrap().unwrap();
/// assert_eq!(delivery.message(), &message);
/// assert_eq!(delivery.attempt(), 1);
/// delivery.ack().await.unwrap();
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        lock(&self.state)
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    /// Make every publish fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make every publish take `per_publish` on `clock` and yield before completing.
    pub fn set_publish_latency(&self, clock: ManualClock, per_publish: chrono::Duration) {
        self.lock().latency = Some(PublishLatency { clock, per_publish });
    }

    /// Every message accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, BusMessage)> {
        self.lock().published.clone()
    }

    /// Messages accepted on one topic, in publish order.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<BusMessage> {
        self.lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Deliver a message to current subscribers without recording a publish.
    ///
    /// Simulates broker-side redelivery of something that was already consumed.
    pub fn inject(&self, topic: &str, message: BusMessage) {
        fan_out(&self.lock(), topic, &message);
    }

    /// Number of acknowledged deliveries.
    #[must_use]
    pub fn ack_count(&self) -> usize {
        self.lock().acks
    }

    /// Number of negatively acknowledged deliveries.
    #[must_use]
    pub fn nack_count(&self) -> usize {
        self.lock().nacks
    }
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fan_out(state: &BusState, topic: &str, message: &BusMessage) {
    for subscriber in &state.subscribers {
        if subscriber.topics.contains(topic) {
            // A closed receiver just means that subscriber went away.
            let _ = subscriber.sender.send(Queued {
                topic: topic.to_string(),
                message: message.clone(),
                attempt: 1,
            });
        }
    }
}

impl MessageBus for InMemoryBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let latency = self.lock().latency.clone();
            if let Some(latency) = latency {
                latency.clock.advance(latency.per_publish);
                tokio::task::yield_now().await;
            }

            let mut state = self.lock();
            if state.unavailable {
                return Err(TransportError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(TransportError::PublishFailed {
                    topic: topic.to_string(),
                    reason: "injected publish failure".to_string(),
                });
            }

            state.published.push((topic.to_string(), message.clone()));
            fan_out(&state, topic, message);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, TransportError>> + Send + '_>> {
        let topics: HashSet<String> = topics.iter().map(|t| (*t).to_string()).collect();
        Box::pin(async move {
            let (sender, mut receiver) = mpsc::unbounded_channel::<Queued>();
            self.lock().subscribers.push(Subscriber {
                topics,
                sender: sender.clone(),
            });

            let state = Arc::clone(&self.state);
            let deliveries: DeliveryStream = Box::pin(stream! {
                while let Some(queued) = receiver.recv().await {
                    let acker = InMemoryAcker {
                        state: Arc::clone(&state),
                        requeue: sender.clone(),
                        queued: queued.clone(),
                    };
                    yield Ok(Delivery::new(
                        queued.topic,
                        queued.message,
                        queued.attempt,
                        Box::new(acker),
                    ));
                }
            });
            Ok(deliveries)
        })
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<BusState>>,
    requeue: mpsc::UnboundedSender<Queued>,
    queued: Queued,
}

impl Acknowledger for InMemoryAcker {
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>> {
        Box::pin(async move {
            lock(&self.state).acks += 1;
            Ok(())
        })
    }

    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>> {
        Box::pin(async move {
            lock(&self.state).nacks += 1;
            let mut again = self.queued;
            again.attempt = again.attempt.saturating_add(1);
            self.requeue
                .send(again)
                .map_err(|_| TransportError::AcknowledgeFailed("subscription closed".to_string()))
        })
    }
}
