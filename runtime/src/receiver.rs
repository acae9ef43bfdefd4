//! Inbound receiver.
//!
//! For every delivery the receiver opens one store transaction, records the message in
//! the inbox, runs the registered handler inside that same transaction and commits. The
//! delivery is acknowledged only after the outcome is durable:
//!
//! | Situation | Store | Bus |
//! |-----------|-------|-----|
//! | handler ok, commit ok | inbox row + effects | ack |
//! | message id already in inbox | nothing | ack |
//! | same message id being recorded by another transaction | nothing | nack |
//! | unknown type, schema mismatch, terminal handler error | dead letter | ack |
//! | recoverable handler error or timeout | nothing | nack (dead letter + ack once `max_deliveries` is reached) |
//! | store or dead-letter sink unavailable | nothing | nack |

use crate::metrics::ReceiverMetrics;
use futures::StreamExt;
use reliable_events_core::bus::{Delivery, MessageBus, TransportError};
use reliable_events_core::config::BridgeConfig;
use reliable_events_core::dead_letter::{DeadLetter, DeadLetterSink};
use reliable_events_core::environment::{Clock, SystemClock};
use reliable_events_core::inbox::{InboxEntry, InboxStore, RecordOutcome};
use reliable_events_core::persistence::PersistenceError;
use reliable_events_core::registry::{HandlerError, InboundError, InboundRegistry, MessageContext};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Receiver tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Topics to subscribe to
    pub topics: Vec<String>,
    /// Bound on a single handler invocation
    pub handler_timeout: Duration,
    /// Deliveries of a recoverable failure before the message is dead-lettered
    pub max_deliveries: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            handler_timeout: Duration::from_secs(10),
            max_deliveries: 5,
        }
    }
}

impl ReceiverConfig {
    /// Receiver for the given topics with default limits.
    #[must_use]
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Derive receiver settings from the bridge configuration.
    #[must_use]
    pub fn from_settings(config: &BridgeConfig) -> Self {
        Self {
            topics: config.bus.subscriptions.clone(),
            handler_timeout: Duration::from_millis(config.receiver.handler_timeout_ms),
            max_deliveries: config.receiver.max_deliveries,
        }
    }

    /// Set the handler timeout.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the delivery limit for recoverable failures.
    #[must_use]
    pub const fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Handler effects and inbox row committed; acked.
    Processed,
    /// Already in the inbox; acked without running the handler.
    Duplicate,
    /// Stored in the dead-letter sink; acked.
    DeadLettered,
    /// Nothing committed; nacked for redelivery.
    Retry,
}

enum Verdict {
    Commit,
    Duplicate,
    /// Another transaction is recording the same message right now.
    Contended(String),
    Poison(String),
    Recoverable(String),
    Unavailable(String),
}

/// Consumes integration events idempotently.
pub struct Receiver<S>
where
    S: InboxStore,
{
    inbox: Arc<S>,
    registry: Arc<InboundRegistry<S::Transaction>>,
    bus: Arc<dyn MessageBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ReceiverConfig,
    clock: Arc<dyn Clock>,
}

impl<S> Receiver<S>
where
    S: InboxStore + 'static,
    S::Transaction: 'static,
{
    /// Create a new receiver.
    #[must_use]
    pub fn new(
        inbox: Arc<S>,
        registry: Arc<InboundRegistry<S::Transaction>>,
        bus: Arc<dyn MessageBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            inbox,
            registry,
            bus,
            dead_letters,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock for inbox and dead-letter timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Process and settle one delivery.
    ///
    /// Never fails: every outcome, including store and bus trouble, is turned into an
    /// ack or a nack and reported through tracing and metrics.
    pub async fn handle_delivery(&self, delivery: Delivery) -> ReceiveOutcome {
        let ctx = MessageContext::from_delivery(&delivery);
        tracing::trace!(
            message_id = %ctx.message_id,
            event_type = %ctx.event_type,
            topic = %ctx.topic,
            attempt = ctx.attempt,
            "Received message"
        );

        let verdict = self.process(&delivery, &ctx).await;
        self.settle(delivery, &ctx, verdict).await
    }

    async fn process(&self, delivery: &Delivery, ctx: &MessageContext) -> Verdict {
        let mut tx = match self.inbox.begin().await {
            Ok(tx) => tx,
            Err(e) => return Verdict::Unavailable(format!("cannot begin transaction: {e}")),
        };

        let entry = InboxEntry::new(ctx.message_id, ctx.event_type.clone(), self.clock.now());
        match self.inbox.record(&mut tx, &entry).await {
            Ok(RecordOutcome::Recorded) => {}
            Ok(RecordOutcome::Duplicate) => {
                self.rollback(tx).await;
                return Verdict::Duplicate;
            }
            Err(PersistenceError::Conflict(reason)) => {
                self.rollback(tx).await;
                return Verdict::Contended(reason);
            }
            Err(e) => {
                self.rollback(tx).await;
                return Verdict::Unavailable(format!("cannot record inbox entry: {e}"));
            }
        }

        let binding = match self.registry.resolve(&ctx.event_type) {
            Ok(binding) => binding,
            Err(e) => {
                self.rollback(tx).await;
                return Verdict::Poison(e.to_string());
            }
        };

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.handler_timeout,
            binding.dispatch(&mut tx, &delivery.message().body, ctx),
        )
        .await;
        ReceiverMetrics::record_handler(&ctx.event_type, started.elapsed());

        match result {
            Ok(Ok(())) => match self.inbox.commit(tx).await {
                Ok(()) => Verdict::Commit,
                Err(e) => Verdict::Unavailable(format!("commit failed: {e}")),
            },
            Ok(Err(InboundError::Codec(e))) => {
                self.rollback(tx).await;
                Verdict::Poison(format!("schema mismatch: {e}"))
            }
            Ok(Err(InboundError::Handler(HandlerError::Terminal(reason)))) => {
                self.rollback(tx).await;
                Verdict::Poison(reason)
            }
            Ok(Err(InboundError::Handler(HandlerError::Recoverable(reason)))) => {
                self.rollback(tx).await;
                Verdict::Recoverable(reason)
            }
            Err(_) => {
                self.rollback(tx).await;
                Verdict::Recoverable(format!(
                    "handler timed out after {:?}",
                    self.config.handler_timeout
                ))
            }
        }
    }

    async fn settle(&self, delivery: Delivery, ctx: &MessageContext, verdict: Verdict) -> ReceiveOutcome {
        match verdict {
            Verdict::Commit => {
                ReceiverMetrics::record_processed(&ctx.event_type);
                tracing::debug!(message_id = %ctx.message_id, event_type = %ctx.event_type, "Message processed");
                ack(delivery, ctx).await;
                ReceiveOutcome::Processed
            }
            Verdict::Duplicate => {
                ReceiverMetrics::record_duplicate(&ctx.event_type);
                tracing::debug!(message_id = %ctx.message_id, event_type = %ctx.event_type, "Duplicate message discarded");
                ack(delivery, ctx).await;
                ReceiveOutcome::Duplicate
            }
            Verdict::Contended(reason) => {
                ReceiverMetrics::record_contended(&ctx.event_type);
                tracing::debug!(
                    message_id = %ctx.message_id,
                    event_type = %ctx.event_type,
                    reason = %reason,
                    "Message already in flight, requesting redelivery"
                );
                nack(delivery, ctx).await;
                ReceiveOutcome::Retry
            }
            Verdict::Poison(reason) => self.dead_letter(delivery, ctx, reason).await,
            Verdict::Recoverable(reason) if ctx.attempt >= self.config.max_deliveries => {
                let reason = format!("gave up after {} deliveries: {reason}", ctx.attempt);
                self.dead_letter(delivery, ctx, reason).await
            }
            Verdict::Recoverable(reason) => {
                ReceiverMetrics::record_retry(&ctx.event_type);
                tracing::warn!(
                    message_id = %ctx.message_id,
                    event_type = %ctx.event_type,
                    attempt = ctx.attempt,
                    max_deliveries = self.config.max_deliveries,
                    error = %reason,
                    "Handler failed, requesting redelivery"
                );
                nack(delivery, ctx).await;
                ReceiveOutcome::Retry
            }
            Verdict::Unavailable(reason) => {
                ReceiverMetrics::record_retry(&ctx.event_type);
                tracing::error!(
                    message_id = %ctx.message_id,
                    event_type = %ctx.event_type,
                    error = %reason,
                    "Store unavailable, requesting redelivery"
                );
                nack(delivery, ctx).await;
                ReceiveOutcome::Retry
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery, ctx: &MessageContext, reason: String) -> ReceiveOutcome {
        let letter = DeadLetter::from_message(
            delivery.message(),
            Some(delivery.topic()),
            reason,
            delivery.attempt(),
            self.clock.now(),
        );

        if let Err(e) = self.dead_letters.send(&letter).await {
            tracing::error!(
                message_id = %ctx.message_id,
                event_type = %ctx.event_type,
                error = %e,
                "Dead-letter sink failed, requesting redelivery"
            );
            nack(delivery, ctx).await;
            return ReceiveOutcome::Retry;
        }

        ReceiverMetrics::record_dead_lettered(&ctx.event_type);
        tracing::warn!(
            message_id = %ctx.message_id,
            event_type = %ctx.event_type,
            topic = %ctx.topic,
            reason = %letter.failure_reason,
            "Message dead-lettered"
        );
        ack(delivery, ctx).await;
        ReceiveOutcome::DeadLettered
    }

    async fn rollback(&self, tx: S::Transaction) {
        if let Err(e) = self.inbox.rollback(tx).await {
            tracing::warn!(error = %e, "Rollback failed");
        }
    }

    /// Subscribe and process deliveries until `shutdown` turns `true`.
    ///
    /// A delivery that has started is always settled before the loop exits.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the subscription cannot be established.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let topics: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        let mut deliveries = self.bus.subscribe(&topics).await?;
        tracing::info!(
            topics = ?topics,
            handlers = ?self.registry.event_types(),
            "Receiver subscribed"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        self.handle_delivery(delivery).await;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Error receiving message from bus");
                    }
                    None => {
                        tracing::warn!("Subscription ended");
                        break;
                    }
                },

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!("Receiver stopped");
        Ok(())
    }
}

async fn ack(delivery: Delivery, ctx: &MessageContext) {
    if let Err(e) = delivery.ack().await {
        tracing::error!(message_id = %ctx.message_id, error = %e, "Failed to acknowledge message");
    }
}

async fn nack(delivery: Delivery, ctx: &MessageContext) {
    if let Err(e) = delivery.nack().await {
        tracing::error!(message_id = %ctx.message_id, error = %e, "Failed to request redelivery");
    }
}

impl<S: InboxStore> std::fmt::Debug for Receiver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use futures::StreamExt;
    use reliable_events_core::bus::MessageBus;
    use reliable_events_core::codec::JsonCodec;
    use reliable_events_core::message::{BusMessage, MessageHeaders, MessageId};
    use reliable_events_core::registry::IntegrationHandler;
    use reliable_events_testing::{
        InMemoryBus, InMemoryDeadLetterSink, InMemoryStore, InMemoryTransaction, ManualClock,
    };
    use serde::{Deserialize, Serialize};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct FacilityClosed {
        facility_id: String,
    }

    /// Marks the facility closed; fails according to `plan` (one entry per call).
    struct CloseFacility {
        store: InMemoryStore,
        calls: Arc<AtomicUsize>,
        plan: Mutex<Vec<Option<HandlerError>>>,
    }

    impl IntegrationHandler<FacilityClosed, InMemoryTransaction> for CloseFacility {
        fn handle<'a>(
            &'a self,
            tx: &'a mut InMemoryTransaction,
            event: FacilityClosed,
            _ctx: &'a MessageContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.store
                    .put(tx, format!("facility:{}", event.facility_id), b"closed".to_vec())?;
                let planned = {
                    let mut plan = self.plan.lock().unwrap();
                    if plan.is_empty() { None } else { plan.remove(0) }
                };
                planned.map_or(Ok(()), Err)
            })
        }
    }

    struct Fixture {
        store: InMemoryStore,
        bus: InMemoryBus,
        sink: InMemoryDeadLetterSink,
        calls: Arc<AtomicUsize>,
        receiver: Receiver<InMemoryStore>,
    }

    fn fixture(plan: Vec<Option<HandlerError>>, config: ReceiverConfig) -> Fixture {
        let clock = ManualClock::starting_at_epoch();
        let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
        let bus = InMemoryBus::new();
        let sink = InMemoryDeadLetterSink::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let registry = InboundRegistry::<InMemoryTransaction>::builder()
            .register::<FacilityClosed, _, _>(
                "FacilityClosed",
                JsonCodec,
                CloseFacility {
                    store: store.clone(),
                    calls: Arc::clone(&calls),
                    plan: Mutex::new(plan),
                },
            )
            .unwrap()
            .build();

        let receiver = Receiver::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            Arc::new(bus.clone()),
            Arc::new(sink.clone()),
            config,
        )
        .with_clock(Arc::new(clock));

        Fixture {
            store,
            bus,
            sink,
            calls,
            receiver,
        }
    }

    fn message(event_type: &str, body: &[u8]) -> BusMessage {
        BusMessage::new(
            MessageId::random(),
            event_type,
            body.to_vec(),
            MessageHeaders::new("F-1", chrono::Utc::now()),
        )
    }

    fn closed() -> BusMessage {
        message("FacilityClosed", br#"{"facility_id":"F-1"}"#)
    }

    async fn deliver(fx: &Fixture, message: &BusMessage, deliveries: usize) -> Vec<ReceiveOutcome> {
        let mut stream = fx.bus.subscribe(&["facility.facility"]).await.unwrap();
        fx.bus.publish("facility.facility", message).await.unwrap();
        let mut outcomes = Vec::new();
        for _ in 0..deliveries {
            let delivery = stream.next().await.unwrap().unwrap();
            outcomes.push(fx.receiver.handle_delivery(delivery).await);
        }
        outcomes
    }

    #[tokio::test]
    async fn processes_and_records_inbox_row() {
        let fx = fixture(vec![], ReceiverConfig::new(["facility.facility"]));
        let msg = closed();

        assert_eq!(deliver(&fx, &msg, 1).await, vec![ReceiveOutcome::Processed]);
        assert_eq!(fx.store.get("facility:F-1"), Some(b"closed".to_vec()));
        assert_eq!(fx.store.inbox_entries().len(), 1);
        assert_eq!(fx.store.inbox_entries()[0].message_id, msg.message_id);
        assert_eq!(fx.bus.ack_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_is_acked_without_running_handler() {
        let fx = fixture(vec![], ReceiverConfig::new(["facility.facility"]));
        let msg = closed();
        let mut stream = fx.bus.subscribe(&["facility.facility"]).await.unwrap();

        fx.bus.publish("facility.facility", &msg).await.unwrap();
        fx.bus.inject("facility.facility", msg.clone());
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert_eq!(fx.receiver.handle_delivery(first).await, ReceiveOutcome::Processed);
        assert_eq!(fx.receiver.handle_delivery(second).await, ReceiveOutcome::Duplicate);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.store.inbox_entries().len(), 1);
        assert_eq!(fx.bus.ack_count(), 2);
    }

    #[tokio::test]
    async fn unknown_type_is_dead_lettered_once_and_acked() {
        let fx = fixture(vec![], ReceiverConfig::new(["facility.facility"]));
        let msg = message("FacilityRenamed", b"{}");

        assert_eq!(deliver(&fx, &msg, 1).await, vec![ReceiveOutcome::DeadLettered]);
        assert_eq!(fx.sink.len(), 1);
        assert!(fx.sink.letters()[0].failure_reason.contains("FacilityRenamed"));
        assert!(fx.store.inbox_entries().is_empty());
        assert_eq!(fx.bus.ack_count(), 1);
        assert_eq!(fx.bus.nack_count(), 0);
    }

    #[tokio::test]
    async fn schema_mismatch_is_dead_lettered() {
        let fx = fixture(vec![], ReceiverConfig::new(["facility.facility"]));
        let msg = message("FacilityClosed", br#"{"id":1}"#);

        assert_eq!(deliver(&fx, &msg, 1).await, vec![ReceiveOutcome::DeadLettered]);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert!(fx.sink.letters()[0].failure_reason.starts_with("schema mismatch"));
    }

    #[tokio::test]
    async fn recoverable_failure_rolls_back_and_is_redelivered() {
        let fx = fixture(
            vec![Some(HandlerError::Recoverable("lock timeout".to_string()))],
            ReceiverConfig::new(["facility.facility"]),
        );
        let msg = closed();

        let outcomes = deliver(&fx, &msg, 2).await;

        assert_eq!(outcomes, vec![ReceiveOutcome::Retry, ReceiveOutcome::Processed]);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fx.store.inbox_entries().len(), 1);
        assert_eq!(fx.bus.nack_count(), 1);
    }

    #[tokio::test]
    async fn repeated_recoverable_failure_is_dead_lettered_at_limit() {
        let failing = || Some(HandlerError::Recoverable("downstream down".to_string()));
        let fx = fixture(
            vec![failing(), failing(), failing()],
            ReceiverConfig::new(["facility.facility"]).with_max_deliveries(3),
        );

        let outcomes = deliver(&fx, &closed(), 3).await;

        assert_eq!(
            outcomes,
            vec![ReceiveOutcome::Retry, ReceiveOutcome::Retry, ReceiveOutcome::DeadLettered]
        );
        assert_eq!(fx.sink.letters()[0].attempts, 3);
        assert_eq!(fx.store.get("facility:F-1"), None);
    }

    #[tokio::test]
    async fn terminal_failure_discards_partial_effects() {
        let fx = fixture(
            vec![Some(HandlerError::Terminal("facility unknown".to_string()))],
            ReceiverConfig::new(["facility.facility"]),
        );

        assert_eq!(deliver(&fx, &closed(), 1).await, vec![ReceiveOutcome::DeadLettered]);
        assert_eq!(fx.store.get("facility:F-1"), None);
        assert!(fx.store.inbox_entries().is_empty());
    }

    #[tokio::test]
    async fn failed_commit_is_redelivered() {
        let fx = fixture(vec![], ReceiverConfig::new(["facility.facility"]));
        fx.store.fail_next_commits(1);

        let outcomes = deliver(&fx, &closed(), 2).await;

        assert_eq!(outcomes, vec![ReceiveOutcome::Retry, ReceiveOutcome::Processed]);
        assert_eq!(fx.store.inbox_entries().len(), 1);
    }

    #[tokio::test]
    async fn message_in_flight_elsewhere_is_nacked_as_contention() {
        let fx = fixture(vec![], ReceiverConfig::new(["facility.facility"]));
        let msg = closed();
        let mut stream = fx.bus.subscribe(&["facility.facility"]).await.unwrap();

        // Another consumer has recorded the message but not committed yet.
        let mut other = fx.store.begin().await.unwrap();
        let entry = InboxEntry::new(msg.message_id, "FacilityClosed", chrono::Utc::now());
        fx.store.record(&mut other, &entry).await.unwrap();

        fx.bus.publish("facility.facility", &msg).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(fx.receiver.handle_delivery(delivery).await, ReceiveOutcome::Retry);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.bus.nack_count(), 1);
        assert!(fx.sink.is_empty());

        fx.store.rollback(other).await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.attempt(), 2);
        assert_eq!(fx.receiver.handle_delivery(redelivered).await, ReceiveOutcome::Processed);
        assert_eq!(fx.store.inbox_entries().len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_nacks_instead_of_losing_the_message() {
        let fx = fixture(vec![], ReceiverConfig::new(["facility.facility"]));
        fx.sink.set_failing(true);

        let outcomes = deliver(&fx, &message("FacilityRenamed", b"{}"), 1).await;

        assert_eq!(outcomes, vec![ReceiveOutcome::Retry]);
        assert_eq!(fx.bus.ack_count(), 0);
        assert_eq!(fx.bus.nack_count(), 1);
    }

    #[tokio::test]
    async fn run_processes_until_shutdown() {
        let fx = Arc::new(fixture(vec![], ReceiverConfig::new(["facility.facility"])));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let fx = Arc::clone(&fx);
            async move { fx.receiver.run(shutdown_rx).await }
        });

        // Subscription happens inside `run`; publish until it is picked up.
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.store.inbox_entries().is_empty() {
                fx.bus.publish("facility.facility", &closed()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
