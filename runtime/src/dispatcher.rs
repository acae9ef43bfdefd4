//! Outbox dispatcher.
//!
//! The dispatcher drains the outbox: it leases a batch, publishes each entry and records
//! the outcome. Several dispatchers may run against the same store; the lease taken by
//! `claim_batch` is the only coordination between them.
//!
//! # Failure policy
//!
//! | Publish result | Outcome |
//! |----------------|---------|
//! | ok | `mark_published` |
//! | transport error, timeout, unroutable | `mark_failed` with backoff, `mark_dead` once `max_attempts` is reached |
//! | codec error | `mark_dead` immediately |
//!
//! After a failure, later entries of the same aggregate in the batch are released
//! untouched so they cannot overtake the failed one.
//!
//! # Leases
//!
//! An entry is only published while its lease still covers a full `publish_timeout`
//! on the dispatcher's clock. Once a batch runs past that point the remaining entries
//! are released for the next claim instead of being sent. Outcome writes are
//! conditional on this instance still owning the lease; a write refused with
//! [`PersistenceError::LeaseLost`] is logged and counted, and the cycle carries on.
//!
//! # Example
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::new(store, publisher, DispatcherConfig::default());
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! tokio::spawn(async move { dispatcher.run(shutdown_rx).await });
//! // ...
//! shutdown_tx.send(true).ok();
//! ```

use crate::metrics::OutboxMetrics;
use crate::publisher::{PublishError, Publisher};
use reliable_events_core::backoff::BackoffPolicy;
use reliable_events_core::config::BridgeConfig;
use reliable_events_core::environment::{Clock, SystemClock};
use reliable_events_core::outbox::{OutboxEntry, OutboxId, OutboxStore};
use reliable_events_core::persistence::PersistenceError;
use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Time between cycles
    pub interval: Duration,
    /// Maximum entries claimed per cycle
    pub batch_size: usize,
    /// Lease taken on claimed entries; publishing stops once less than `publish_timeout` is left
    pub lease_duration: Duration,
    /// Attempts before an entry goes `Dead`
    pub max_attempts: u32,
    /// Bound on a single publish
    pub publish_timeout: Duration,
    /// Retry schedule for failed entries
    pub backoff: BackoffPolicy,
    /// How long published entries are kept; `None` keeps them forever
    pub retention: Option<Duration>,
    /// How often retention runs when enabled
    pub retention_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            batch_size: 100,
            lease_duration: Duration::from_secs(30),
            max_attempts: 10,
            publish_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            retention: None,
            retention_interval: Duration::from_secs(3600),
        }
    }
}

impl DispatcherConfig {
    /// Derive dispatcher settings from the bridge configuration.
    #[must_use]
    pub fn from_settings(config: &BridgeConfig) -> Self {
        let settings = &config.dispatcher;
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            batch_size: settings.batch_size,
            lease_duration: Duration::from_millis(settings.lease_ms),
            max_attempts: settings.max_attempts,
            publish_timeout: Duration::from_millis(settings.publish_timeout_ms),
            backoff: config.backoff_policy(),
            retention: settings.retention_secs.map(Duration::from_secs),
            ..Self::default()
        }
    }

    /// Set the cycle interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the lease duration.
    #[must_use]
    pub const fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Set the attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the publish timeout.
    #[must_use]
    pub const fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set the backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enable retention of published entries.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Entries leased
    pub claimed: usize,
    /// Entries delivered
    pub published: usize,
    /// Entries rescheduled
    pub failed: usize,
    /// Entries given up on
    pub dead: usize,
    /// Entries released untouched to keep aggregate order
    pub deferred: usize,
    /// Entries released unsent because their lease could not cover another publish
    pub expired: usize,
    /// Outcomes not recorded because another dispatcher had taken the lease over
    pub lease_lost: usize,
}

impl AddAssign for DispatchReport {
    fn add_assign(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.published += other.published;
        self.failed += other.failed;
        self.dead += other.dead;
        self.deferred += other.deferred;
        self.expired += other.expired;
        self.lease_lost += other.lease_lost;
    }
}

/// Drains the outbox to the bus.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<Publisher>,
    config: DispatcherConfig,
    instance_id: String,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Create a dispatcher with a fresh instance id.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, publisher: Arc<Publisher>, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            instance_id: format!("dispatcher-{}", Uuid::new_v4()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock for lease checks and retention cutoffs.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lease owner name of this instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run a single claim → publish → record cycle.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store fails; the cycle stops there and leases
    /// it still holds lapse on their own. A lost lease is not an error.
    pub async fn run_once(&self) -> Result<DispatchReport, PersistenceError> {
        let started = Instant::now();
        let batch = self
            .store
            .claim_batch(&self.instance_id, self.config.batch_size, self.config.lease_duration)
            .await?;

        let mut report = DispatchReport {
            claimed: batch.len(),
            ..DispatchReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let mut blocked: HashSet<&str> = HashSet::new();
        let mut deferred: Vec<OutboxId> = Vec::new();
        let mut expired: Vec<OutboxId> = Vec::new();

        for entry in &batch {
            if blocked.contains(entry.aggregate_id.as_str()) {
                deferred.push(entry.id);
                continue;
            }
            // Later entries of the aggregate must not overtake an expired one.
            if !self.lease_covers_publish(entry) {
                blocked.insert(entry.aggregate_id.as_str());
                expired.push(entry.id);
                continue;
            }

            match self.publish(entry).await {
                Ok(()) => match self.store.mark_published(&self.instance_id, &[entry.id]).await {
                    Ok(()) => {
                        OutboxMetrics::record_published(&entry.event_type);
                        report.published += 1;
                    }
                    Err(PersistenceError::LeaseLost(reason)) => {
                        self.lost_lease(entry, &reason);
                        report.lease_lost += 1;
                    }
                    Err(e) => return Err(e),
                },
                Err(error) => {
                    blocked.insert(entry.aggregate_id.as_str());
                    match self.give_up(entry, &error).await {
                        Ok(true) => report.dead += 1,
                        Ok(false) => report.failed += 1,
                        Err(PersistenceError::LeaseLost(reason)) => {
                            self.lost_lease(entry, &reason);
                            report.lease_lost += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if !expired.is_empty() {
            tracing::warn!(
                instance_id = %self.instance_id,
                expired = expired.len(),
                lease_ms = self.config.lease_duration.as_millis(),
                "Lease ran short before the batch finished, releasing the rest"
            );
            report.expired = expired.len();
            deferred.append(&mut expired);
        }
        if !deferred.is_empty() {
            self.store.release(&self.instance_id, &deferred).await?;
            report.deferred = deferred.len() - report.expired;
        }

        OutboxMetrics::record_cycle(started.elapsed());
        tracing::debug!(
            instance_id = %self.instance_id,
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            dead = report.dead,
            deferred = report.deferred,
            expired = report.expired,
            lease_lost = report.lease_lost,
            "Dispatch cycle finished"
        );
        Ok(report)
    }

    /// Run cycles until nothing is claimable, at most `max_cycles` times.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] from the first failing cycle.
    pub async fn drain(&self, max_cycles: usize) -> Result<DispatchReport, PersistenceError> {
        let mut total = DispatchReport::default();
        for _ in 0..max_cycles {
            let report = self.run_once().await?;
            total += report;
            if report.claimed == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Delete published entries older than the retention window.
    ///
    /// Returns `0` when retention is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store fails.
    pub async fn purge_expired(&self) -> Result<u64, PersistenceError> {
        let Some(retention) = self.config.retention else {
            return Ok(0);
        };
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let purged = self.store.purge_published(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "Purged published outbox entries");
        }
        Ok(purged)
    }

    /// Run cycles on the configured interval until `shutdown` turns `true`.
    ///
    /// A cycle that has started always finishes before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            instance_id = %self.instance_id,
            interval_ms = self.config.interval.as_millis(),
            batch_size = self.config.batch_size,
            "Starting outbox dispatcher"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention_ticker = tokio::time::interval(self.config.retention_interval);
        retention_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let retention_enabled = self.config.retention.is_some();

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }

                _ = retention_ticker.tick(), if retention_enabled => {
                    if let Err(e) = self.purge_expired().await {
                        tracing::error!(error = %e, "Outbox retention failed");
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(instance_id = %self.instance_id, "Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!(instance_id = %self.instance_id, "Outbox dispatcher stopped");
    }

    async fn cycle(&self) {
        match self.run_once().await {
            Ok(report) if report.dead > 0 || report.failed > 0 || report.lease_lost > 0 => {
                tracing::warn!(
                    instance_id = %self.instance_id,
                    failed = report.failed,
                    dead = report.dead,
                    lease_lost = report.lease_lost,
                    "Dispatch cycle had failures"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "Dispatch cycle aborted"
                );
            }
        }

        match self.store.stats().await {
            Ok(stats) => OutboxMetrics::record_stats(&stats),
            Err(e) => tracing::warn!(error = %e, "Failed to read outbox stats"),
        }
    }

    /// Whether the entry's lease outlasts one more bounded publish.
    fn lease_covers_publish(&self, entry: &OutboxEntry) -> bool {
        let Some(expires_at) = entry.lease_expires_at else {
            return false;
        };
        let timeout = chrono::Duration::from_std(self.config.publish_timeout).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_add_signed(timeout)
            .is_some_and(|deadline| deadline < expires_at)
    }

    fn lost_lease(&self, entry: &OutboxEntry, reason: &str) {
        tracing::warn!(
            instance_id = %self.instance_id,
            outbox_id = %entry.id,
            aggregate_id = %entry.aggregate_id,
            reason = %reason,
            "Lease lost before the outcome was recorded"
        );
    }

    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        match tokio::time::timeout(self.config.publish_timeout, self.publisher.publish(entry)).await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(PublishError::Timeout(self.config.publish_timeout)),
        }
    }

    /// Record a failed publish; returns `true` if the entry went `Dead`.
    async fn give_up(&self, entry: &OutboxEntry, error: &PublishError) -> Result<bool, PersistenceError> {
        let attempt = entry.attempt_count.saturating_add(1);
        let reason = error.to_string();

        if !error.is_retryable() || attempt >= self.config.max_attempts {
            self.store.mark_dead(&self.instance_id, entry.id, &reason).await?;
            OutboxMetrics::record_dead(&entry.event_type);
            tracing::warn!(
                outbox_id = %entry.id,
                event_type = %entry.event_type,
                aggregate_id = %entry.aggregate_id,
                attempt,
                error = %reason,
                "Outbox entry is dead"
            );
            return Ok(true);
        }

        self.store
            .mark_failed(&self.instance_id, entry.id, &reason, &self.config.backoff)
            .await?;
        OutboxMetrics::record_failed(&entry.event_type);
        tracing::warn!(
            outbox_id = %entry.id,
            event_type = %entry.event_type,
            aggregate_id = %entry.aggregate_id,
            attempt,
            max_attempts = self.config.max_attempts,
            error = %reason,
            "Publish failed, entry rescheduled"
        );
        Ok(false)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use reliable_events_core::codec::JsonCodec;
    use reliable_events_core::config::TopicNaming;
    use reliable_events_core::event::IntegrationEvent;
    use reliable_events_core::outbox::{NewOutboxEntry, OutboxStatus, TransactionalOutbox};
    use reliable_events_core::registry::OutboundRegistry;
    use reliable_events_testing::{InMemoryBus, InMemoryStore, ManualClock};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct BookingCreated {
        booking_id: String,
        seq: u32,
    }

    impl IntegrationEvent for BookingCreated {
        fn event_type(&self) -> &'static str {
            "BookingCreated"
        }
    }

    struct Fixture {
        store: InMemoryStore,
        bus: InMemoryBus,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::starting_at_epoch();
            Self {
                store: InMemoryStore::with_clock(Arc::new(clock.clone())),
                bus: InMemoryBus::new(),
                clock,
            }
        }

        fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher {
            let registry = OutboundRegistry::builder()
                .register::<BookingCreated, _>("BookingCreated", "booking", JsonCodec)
                .unwrap()
                .build();
            let publisher = Publisher::new(
                Arc::new(registry),
                Arc::new(self.bus.clone()),
                TopicNaming::new("bookings"),
            );
            Dispatcher::new(Arc::new(self.store.clone()), Arc::new(publisher), config)
                .with_clock(Arc::new(self.clock.clone()))
        }

        async fn append(&self, event_type: &str, aggregate: &str, seq: u32) -> OutboxId {
            let event = BookingCreated {
                booking_id: aggregate.to_string(),
                seq,
            };
            let entry = NewOutboxEntry::new(event_type, aggregate, event.to_bytes().unwrap());
            let mut tx = self.store.begin_transaction();
            let id = self.store.append(&mut tx, entry).await.unwrap();
            self.store.commit_transaction(tx).unwrap();
            self.clock.advance(chrono::Duration::milliseconds(1));
            id
        }
    }

    fn no_jitter() -> DispatcherConfig {
        DispatcherConfig::default().with_backoff(
            BackoffPolicy::builder()
                .initial_delay(Duration::from_secs(1))
                .jitter(0.0)
                .build(),
        )
    }

    #[tokio::test]
    async fn publishes_pending_entries_in_aggregate_order() {
        let fx = Fixture::new();
        fx.append("BookingCreated", "B1", 1).await;
        fx.append("BookingCreated", "B2", 1).await;
        fx.append("BookingCreated", "B1", 2).await;

        let report = fx.dispatcher(no_jitter()).run_once().await.unwrap();

        assert_eq!(report.published, 3);
        let b1: Vec<u32> = fx
            .bus
            .published_to("bookings.booking")
            .iter()
            .filter(|m| m.headers.partition_key == "B1")
            .map(|m| serde_json::from_slice::<serde_json::Value>(&m.body).unwrap()["seq"].as_u64().unwrap() as u32)
            .collect();
        assert_eq!(b1, vec![1, 2]);
        assert!(fx.store.outbox_entries().iter().all(|e| e.status == OutboxStatus::Published));
    }

    #[tokio::test]
    async fn failure_defers_rest_of_aggregate() {
        let fx = Fixture::new();
        let first = fx.append("BookingCreated", "B1", 1).await;
        let second = fx.append("BookingCreated", "B1", 2).await;
        let other = fx.append("BookingCreated", "B2", 1).await;
        fx.bus.fail_next_publishes(1);

        let report = fx.dispatcher(no_jitter()).run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.published, 1);
        assert_eq!(fx.store.outbox_entry(first).unwrap().status, OutboxStatus::Failed);
        let deferred = fx.store.outbox_entry(second).unwrap();
        assert_eq!(deferred.status, OutboxStatus::Pending);
        assert!(deferred.lease_owner.is_none());
        assert_eq!(fx.store.outbox_entry(other).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn failed_entry_is_retried_after_backoff() {
        let fx = Fixture::new();
        let id = fx.append("BookingCreated", "B1", 1).await;
        fx.bus.fail_next_publishes(1);
        let dispatcher = fx.dispatcher(no_jitter());

        dispatcher.run_once().await.unwrap();
        assert_eq!(dispatcher.run_once().await.unwrap().claimed, 0);

        fx.clock.advance(chrono::Duration::seconds(1));
        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        let entry = fx.store.outbox_entry(id).unwrap();
        assert_eq!(entry.status, OutboxStatus::Published);
        assert_eq!(entry.attempt_count, 1);
    }

    #[tokio::test]
    async fn unroutable_entry_goes_dead_after_max_attempts() {
        let fx = Fixture::new();
        let id = fx.append("BookingMoved", "B1", 1).await;
        let dispatcher = fx.dispatcher(no_jitter().with_max_attempts(3));

        for _ in 0..3 {
            dispatcher.run_once().await.unwrap();
            fx.clock.advance(chrono::Duration::minutes(10));
        }

        let entry = fx.store.outbox_entry(id).unwrap();
        assert_eq!(entry.status, OutboxStatus::Dead);
        assert_eq!(entry.attempt_count, 3);
        assert!(entry.last_error.unwrap().contains("BookingMoved"));
        assert!(fx.bus.published().is_empty());
        assert_eq!(dispatcher.run_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn corrupt_payload_goes_dead_immediately() {
        let fx = Fixture::new();
        let mut tx = fx.store.begin_transaction();
        let id = fx
            .store
            .append(&mut tx, NewOutboxEntry::new("BookingCreated", "B1", vec![0xff]))
            .await
            .unwrap();
        fx.store.commit_transaction(tx).unwrap();

        let report = fx.dispatcher(no_jitter()).run_once().await.unwrap();

        assert_eq!(report.dead, 1);
        assert_eq!(fx.store.outbox_entry(id).unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn drain_stops_when_nothing_is_claimable() {
        let fx = Fixture::new();
        for seq in 1..=5 {
            fx.append("BookingCreated", "B1", seq).await;
        }
        let dispatcher = fx.dispatcher(no_jitter().with_batch_size(2));

        let total = dispatcher.drain(10).await.unwrap();
        assert_eq!(total.published, 5);
        assert_eq!(fx.bus.published().len(), 5);
    }

    #[tokio::test]
    async fn retention_purges_old_published_entries() {
        let fx = Fixture::new();
        fx.append("BookingCreated", "B1", 1).await;
        let dispatcher = fx.dispatcher(no_jitter().with_retention(Duration::from_secs(60)));
        dispatcher.run_once().await.unwrap();

        assert_eq!(dispatcher.purge_expired().await.unwrap(), 0);
        fx.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(dispatcher.purge_expired().await.unwrap(), 1);
        assert!(fx.store.outbox_entries().is_empty());
    }

    #[tokio::test]
    async fn batch_stops_publishing_when_the_lease_runs_short() {
        let fx = Fixture::new();
        for n in 0..10 {
            fx.append("BookingCreated", &format!("B{n}"), 1).await;
        }
        fx.bus.set_publish_latency(fx.clock.clone(), chrono::Duration::seconds(4));
        let dispatcher = fx.dispatcher(no_jitter().with_batch_size(10));

        // 30s lease, 5s publish timeout: publishes start at 0s..24s, the rest is released.
        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.claimed, 10);
        assert_eq!(report.published, 7);
        assert_eq!(report.expired, 3);
        assert_eq!(report.deferred, 0);
        let released: Vec<_> = fx
            .store
            .outbox_entries()
            .into_iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .collect();
        assert_eq!(released.len(), 3);
        assert!(released.iter().all(|e| e.lease_owner.is_none()));

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report.published, 3);
        assert_eq!(fx.bus.published().len(), 10);
    }

    #[tokio::test]
    async fn expired_entry_holds_back_its_aggregate() {
        let fx = Fixture::new();
        fx.append("BookingCreated", "B1", 1).await;
        fx.append("BookingCreated", "B2", 1).await;
        fx.append("BookingCreated", "B2", 2).await;
        fx.bus.set_publish_latency(fx.clock.clone(), chrono::Duration::seconds(26));

        let report = fx.dispatcher(no_jitter()).run_once().await.unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.deferred, 1);
    }

    #[tokio::test]
    async fn overtaken_lease_is_counted_not_fatal() {
        let fx = Fixture::new();
        let id = fx.append("BookingCreated", "B1", 1).await;
        // A publish outlasting the lease lets the second dispatcher take the entry over.
        fx.bus.set_publish_latency(fx.clock.clone(), chrono::Duration::seconds(4));
        let config = no_jitter()
            .with_lease_duration(Duration::from_secs(3))
            .with_publish_timeout(Duration::from_secs(1));
        let first = fx.dispatcher(config.clone());
        let second = fx.dispatcher(config);

        let (a, b) = tokio::join!(first.run_once(), second.run_once());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.lease_lost, 1);
        assert_eq!(a.published, 0);
        assert_eq!(b.published, 1);
        assert_eq!(fx.store.outbox_entry(id).unwrap().status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let fx = Fixture::new();
        fx.append("BookingCreated", "B1", 1).await;
        let dispatcher = Arc::new(fx.dispatcher(no_jitter().with_interval(Duration::from_millis(10))));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run(shutdown_rx).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.bus.published().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn config_from_settings() {
        let mut settings = BridgeConfig::default();
        settings.dispatcher.batch_size = 7;
        settings.dispatcher.retention_secs = Some(120);

        let config = DispatcherConfig::from_settings(&settings);
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.retention, Some(Duration::from_secs(120)));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
    }
}
