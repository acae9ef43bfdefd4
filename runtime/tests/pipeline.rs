//! End-to-end tests: booking service outbox → bus → facility service inbox.
#![allow(clippy::unwrap_used)] // Test code can use unwrap

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reliable_events_core::backoff::BackoffPolicy;
use reliable_events_core::bus::MessageBus;
use reliable_events_core::codec::JsonCodec;
use reliable_events_core::config::TopicNaming;
use reliable_events_core::event::IntegrationEvent;
use reliable_events_core::outbox::{
    NewOutboxEntry, OutboxEntry, OutboxId, OutboxStats, OutboxStatus, OutboxStore, TransactionalOutbox,
};
use reliable_events_core::persistence::PersistenceError;
use reliable_events_core::registry::{
    HandlerError, InboundRegistry, IntegrationHandler, MessageContext, OutboundRegistry,
};
use reliable_events_runtime::{
    Dispatcher, DispatcherConfig, Publisher, ReceiveOutcome, Receiver, ReceiverConfig,
};
use reliable_events_testing::{
    InMemoryBus, InMemoryDeadLetterSink, InMemoryStore, InMemoryTransaction, ManualClock,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const TOPIC: &str = "integration.booking";

#[derive(Debug, Clone, Serialize, Deserialize)]
enum BookingEvent {
    BookingCreated { booking_id: String, table: u32 },
    BookingCancelled { booking_id: String },
}

impl IntegrationEvent for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } => "BookingCreated",
            Self::BookingCancelled { .. } => "BookingCancelled",
        }
    }
}

/// Facility side: keeps a per-booking occupancy row.
struct Occupancy {
    store: InMemoryStore,
}

impl IntegrationHandler<BookingEvent, InMemoryTransaction> for Occupancy {
    fn handle<'a>(
        &'a self,
        tx: &'a mut InMemoryTransaction,
        event: BookingEvent,
        _ctx: &'a MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            match event {
                BookingEvent::BookingCreated { booking_id, table } => {
                    let key = format!("occupancy:{booking_id}");
                    let count = self
                        .store
                        .get_in(tx, &key)?
                        .map_or(0, |v| u32::from_be_bytes(v.try_into().unwrap()));
                    self.store.put(tx, key, (count + 1).to_be_bytes().to_vec())?;
                    self.store.put(tx, format!("table:{booking_id}"), table.to_be_bytes().to_vec())?;
                }
                BookingEvent::BookingCancelled { booking_id } => {
                    self.store.delete(tx, &format!("table:{booking_id}"))?;
                }
            }
            Ok(())
        })
    }
}

/// Outbox store whose `mark_published` fails a configured number of times, as if the
/// dispatcher crashed between sending and recording.
struct CrashAfterSend {
    inner: InMemoryStore,
    failures: AtomicU32,
}

impl OutboxStore for CrashAfterSend {
    fn claim_batch<'a>(
        &'a self,
        owner: &'a str,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + 'a>> {
        self.inner.claim_batch(owner, limit, lease)
    }

    fn mark_published<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        let crashed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if crashed {
            return Box::pin(async {
                Err(PersistenceError::DatabaseError("connection reset".to_string()))
            });
        }
        self.inner.mark_published(owner, ids)
    }

    fn mark_failed<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
        backoff: &'a BackoffPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        self.inner.mark_failed(owner, id, error, backoff)
    }

    fn mark_dead<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        self.inner.mark_dead(owner, id, error)
    }

    fn release<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        self.inner.release(owner, ids)
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<OutboxStats, PersistenceError>> + Send + '_>> {
        self.inner.stats()
    }

    fn list_dead(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + '_>> {
        self.inner.list_dead(limit)
    }

    fn requeue_dead(
        &self,
        id: OutboxId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        self.inner.requeue_dead(id)
    }

    fn purge_published(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>> {
        self.inner.purge_published(older_than)
    }
}

struct Bridge {
    clock: ManualClock,
    bookings: InMemoryStore,
    facility: InMemoryStore,
    bus: InMemoryBus,
    dead_letters: InMemoryDeadLetterSink,
}

impl Bridge {
    fn new() -> Self {
        let clock = ManualClock::starting_at_epoch();
        Self {
            bookings: InMemoryStore::with_clock(Arc::new(clock.clone())),
            facility: InMemoryStore::with_clock(Arc::new(clock.clone())),
            bus: InMemoryBus::new(),
            dead_letters: InMemoryDeadLetterSink::new(),
            clock,
        }
    }

    fn publisher(&self) -> Arc<Publisher> {
        let registry = OutboundRegistry::builder()
            .register::<BookingEvent, _>("BookingCreated", "booking", JsonCodec)
            .unwrap()
            .register::<BookingEvent, _>("BookingCancelled", "booking", JsonCodec)
            .unwrap()
            .build();
        Arc::new(Publisher::new(
            Arc::new(registry),
            Arc::new(self.bus.clone()),
            TopicNaming::new("integration"),
        ))
    }

    fn dispatcher(&self, store: Arc<dyn OutboxStore>) -> Dispatcher {
        let config = DispatcherConfig::default().with_lease_duration(Duration::from_secs(30));
        Dispatcher::new(store, self.publisher(), config).with_clock(Arc::new(self.clock.clone()))
    }

    fn receiver(&self) -> Receiver<InMemoryStore> {
        let registry = InboundRegistry::<InMemoryTransaction>::builder()
            .register::<BookingEvent, _, _>(
                "BookingCreated",
                JsonCodec,
                Occupancy {
                    store: self.facility.clone(),
                },
            )
            .unwrap()
            .register::<BookingEvent, _, _>(
                "BookingCancelled",
                JsonCodec,
                Occupancy {
                    store: self.facility.clone(),
                },
            )
            .unwrap()
            .build();
        Receiver::new(
            Arc::new(self.facility.clone()),
            Arc::new(registry),
            Arc::new(self.bus.clone()),
            Arc::new(self.dead_letters.clone()),
            ReceiverConfig::new([TOPIC]),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }

    /// Domain write plus outbox append in one transaction.
    async fn book(&self, booking_id: &str, event: &BookingEvent) {
        let mut tx = self.bookings.begin_transaction();
        self.bookings
            .put(&mut tx, format!("booking:{booking_id}"), event.event_type().as_bytes().to_vec())
            .unwrap();
        self.bookings
            .append(&mut tx, NewOutboxEntry::from_event(booking_id, event).unwrap())
            .await
            .unwrap();
        self.bookings.commit_transaction(tx).unwrap();
        self.clock.advance(chrono::Duration::milliseconds(1));
    }
}

fn created(booking_id: &str, table: u32) -> BookingEvent {
    BookingEvent::BookingCreated {
        booking_id: booking_id.to_string(),
        table,
    }
}

#[tokio::test]
async fn booking_reaches_facility_exactly_once() {
    let bridge = Bridge::new();
    let receiver = bridge.receiver();
    let mut deliveries = bridge.bus.subscribe(&[TOPIC]).await.unwrap();

    bridge.book("B1", &created("B1", 7)).await;
    bridge
        .book(
            "B1",
            &BookingEvent::BookingCancelled {
                booking_id: "B1".to_string(),
            },
        )
        .await;

    let report = bridge
        .dispatcher(Arc::new(bridge.bookings.clone()))
        .drain(5)
        .await
        .unwrap();
    assert_eq!(report.published, 2);

    // The broker redelivers the first message.
    let first = bridge.bus.published_to(TOPIC)[0].clone();
    bridge.bus.inject(TOPIC, first);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let delivery = deliveries.next().await.unwrap().unwrap();
        outcomes.push(receiver.handle_delivery(delivery).await);
    }

    assert_eq!(
        outcomes,
        vec![ReceiveOutcome::Processed, ReceiveOutcome::Processed, ReceiveOutcome::Duplicate]
    );
    assert_eq!(bridge.facility.get("occupancy:B1"), Some(1u32.to_be_bytes().to_vec()));
    assert_eq!(bridge.facility.get("table:B1"), None);
    assert_eq!(bridge.facility.inbox_entries().len(), 2);
    assert!(bridge.dead_letters.is_empty());
}

#[tokio::test]
async fn rolled_back_domain_write_never_publishes() {
    let bridge = Bridge::new();
    let mut tx = bridge.bookings.begin_transaction();
    bridge
        .bookings
        .append(&mut tx, NewOutboxEntry::from_event("B9", &created("B9", 1)).unwrap())
        .await
        .unwrap();
    bridge.bookings.rollback_transaction(tx).unwrap();

    let report = bridge
        .dispatcher(Arc::new(bridge.bookings.clone()))
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.claimed, 0);
    assert!(bridge.bus.published().is_empty());
}

#[tokio::test]
async fn crash_after_send_republishes_same_id_and_receiver_dedupes() {
    let bridge = Bridge::new();
    let receiver = bridge.receiver();
    let mut deliveries = bridge.bus.subscribe(&[TOPIC]).await.unwrap();
    bridge.book("B1", &created("B1", 3)).await;

    let flaky = Arc::new(CrashAfterSend {
        inner: bridge.bookings.clone(),
        failures: AtomicU32::new(1),
    });
    let dispatcher = bridge.dispatcher(flaky);

    // Sent, but the outcome was never recorded.
    assert!(dispatcher.run_once().await.is_err());
    let entry = bridge.bookings.outbox_entries()[0].clone();
    assert_eq!(entry.status, OutboxStatus::Pending);

    // The lease still holds, so nobody resends yet.
    assert_eq!(dispatcher.run_once().await.unwrap().claimed, 0);

    bridge.clock.advance(chrono::Duration::seconds(31));
    assert_eq!(dispatcher.run_once().await.unwrap().published, 1);

    let sent = bridge.bus.published_to(TOPIC);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].message_id, sent[1].message_id);
    assert_eq!(sent[0].message_id, entry.message_id());

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let delivery = deliveries.next().await.unwrap().unwrap();
        outcomes.push(receiver.handle_delivery(delivery).await);
    }
    assert_eq!(outcomes, vec![ReceiveOutcome::Processed, ReceiveOutcome::Duplicate]);
    assert_eq!(bridge.facility.inbox_entries().len(), 1);
    assert_eq!(bridge.facility.get("occupancy:B1"), Some(1u32.to_be_bytes().to_vec()));
}

#[tokio::test]
async fn poison_message_does_not_block_the_topic() {
    let bridge = Bridge::new();
    let receiver = bridge.receiver();
    let mut deliveries = bridge.bus.subscribe(&[TOPIC]).await.unwrap();

    let publisher = bridge.publisher();
    let mut poison = {
        bridge.book("B2", &created("B2", 1)).await;
        let entry = bridge.bookings.outbox_entries()[0].clone();
        publisher.to_message(&entry).unwrap().1
    };
    poison.body = b"not json".to_vec();
    bridge.bus.publish(TOPIC, &poison).await.unwrap();

    bridge
        .dispatcher(Arc::new(bridge.bookings.clone()))
        .drain(5)
        .await
        .unwrap();

    let first = deliveries.next().await.unwrap().unwrap();
    let second = deliveries.next().await.unwrap().unwrap();

    assert_eq!(receiver.handle_delivery(first).await, ReceiveOutcome::DeadLettered);
    // Same message id as the poisoned copy, but it was never recorded.
    assert_eq!(receiver.handle_delivery(second).await, ReceiveOutcome::Processed);
    assert!(bridge.dead_letters.contains(poison.message_id));
    assert_eq!(bridge.facility.get("table:B2"), Some(1u32.to_be_bytes().to_vec()));
}

#[tokio::test]
async fn dead_entry_can_be_requeued_and_published() {
    let bridge = Bridge::new();
    bridge.book("B3", &created("B3", 2)).await;
    bridge.bus.set_unavailable(true);

    let dispatcher = Dispatcher::new(
        Arc::new(bridge.bookings.clone()),
        bridge.publisher(),
        DispatcherConfig::default().with_max_attempts(1),
    )
    .with_clock(Arc::new(bridge.clock.clone()));

    assert_eq!(dispatcher.run_once().await.unwrap().dead, 1);
    let dead = bridge.bookings.list_dead(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.as_deref().unwrap().contains("broker unavailable"));

    bridge.bus.set_unavailable(false);
    assert!(bridge.bookings.requeue_dead(dead[0].id).await.unwrap());
    assert_eq!(dispatcher.run_once().await.unwrap().published, 1);
    assert_eq!(bridge.bookings.stats().await.unwrap().published, 1);
}
