//! Booking Bridge - in-process demo of the reliable event pipeline
//!
//! A booking service writes bookings and appends `BookingCreated` / `BookingCancelled`
//! events to its outbox in the same transaction. The dispatcher relays them to the
//! bus, and the facility service's receiver applies them exactly once through its
//! inbox.
//!
//! Everything runs in memory, so no broker or database is needed.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=info,reliable_events=debug cargo run -p booking-bridge
//! ```
//!
//! Set `BRIDGE_METRICS_ADDR=127.0.0.1:9000` to expose Prometheus metrics at
//! <http://127.0.0.1:9000/metrics> while the demo runs. Ctrl-C stops it early.

#![allow(missing_docs)]

use anyhow::Context;
use reliable_events_core::codec::JsonCodec;
use reliable_events_core::config::BridgeConfig;
use reliable_events_core::event::IntegrationEvent;
use reliable_events_core::outbox::{NewOutboxEntry, OutboxStore, TransactionalOutbox};
use reliable_events_core::registry::{
    HandlerError, InboundRegistry, IntegrationHandler, MessageContext, OutboundRegistry,
};
use reliable_events_runtime::metrics::MetricsServer;
use reliable_events_runtime::{Dispatcher, DispatcherConfig, Publisher, Receiver, ReceiverConfig};
use reliable_events_testing::{
    InMemoryBus, InMemoryDeadLetterSink, InMemoryStore, InMemoryTransaction,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOGICAL_TOPIC: &str = "booking";

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

/// Facility side: reserves and frees tables.
#[derive(Clone)]
struct TablePlan {
    store: InMemoryStore,
}

impl IntegrationHandler<BookingEvent, InMemoryTransaction> for TablePlan {
    fn handle<'a>(
        &'a self,
        tx: &'a mut InMemoryTransaction,
        event: BookingEvent,
        ctx: &'a MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            match event {
                BookingEvent::BookingCreated { booking_id, table } => {
                    tracing::info!(
                        booking_id = %booking_id,
                        table = table,
                        message_id = %ctx.message_id,
                        "Reserving table"
                    );
                    self.store
                        .put(tx, format!("table:{booking_id}"), table.to_be_bytes().to_vec())?;
                }
                BookingEvent::BookingCancelled { booking_id } => {
                    tracing::info!(booking_id = %booking_id, "Freeing table");
                    self.store.delete(tx, &format!("table:{booking_id}"))?;
                }
            }
            Ok(())
        })
    }
}

/// Writes the booking row and its outbox entry in one transaction.
async fn book(bookings: &InMemoryStore, booking_id: &str, event: &BookingEvent) -> anyhow::Result<()> {
    let mut tx = bookings.begin_transaction();
    bookings.put(
        &mut tx,
        format!("booking:{booking_id}"),
        event.event_type().as_bytes().to_vec(),
    )?;
    bookings
        .append(&mut tx, NewOutboxEntry::from_event(booking_id, event)?)
        .await?;
    bookings.commit_transaction(tx)?;
    Ok(())
}

fn outbound_registry() -> anyhow::Result<OutboundRegistry> {
    Ok(OutboundRegistry::builder()
        .register::<BookingEvent, _>("BookingCreated", LOGICAL_TOPIC, JsonCodec)?
        .register::<BookingEvent, _>("BookingCancelled", LOGICAL_TOPIC, JsonCodec)?
        .build())
}

fn inbound_registry(plan: &TablePlan) -> anyhow::Result<InboundRegistry<InMemoryTransaction>> {
    Ok(InboundRegistry::<InMemoryTransaction>::builder()
        .register::<BookingEvent, _, _>("BookingCreated", JsonCodec, plan.clone())?
        .register::<BookingEvent, _, _>("BookingCancelled", JsonCodec, plan.clone())?
        .build())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reliable_events_runtime=debug,booking_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::from_env();
    config.validate().context("invalid bridge configuration")?;

    let mut metrics = None;
    if let Some(addr) = &config.metrics_addr {
        let mut server = MetricsServer::new(addr.parse().context("BRIDGE_METRICS_ADDR")?);
        server.start()?;
        metrics = Some(server);
    }

    let naming = config.topic_naming();
    let topic = naming.topic_for(LOGICAL_TOPIC);

    let bookings = InMemoryStore::new();
    let facility = InMemoryStore::new();
    let bus = InMemoryBus::new();
    let dead_letters = InMemoryDeadLetterSink::new();

    let publisher = Arc::new(Publisher::new(
        Arc::new(outbound_registry()?),
        Arc::new(bus.clone()),
        naming,
    ));
    let outbox: Arc<dyn OutboxStore> = Arc::new(bookings.clone());
    let dispatcher = Dispatcher::new(
        outbox,
        publisher,
        DispatcherConfig::from_settings(&config).with_interval(Duration::from_millis(100)),
    );

    let plan = TablePlan {
        store: facility.clone(),
    };
    let receiver_config = ReceiverConfig::from_settings(&config);
    let receiver_config = if receiver_config.topics.is_empty() {
        ReceiverConfig {
            topics: vec![topic.clone()],
            ..receiver_config
        }
    } else {
        receiver_config
    };
    let receiver = Receiver::new(
        Arc::new(facility.clone()),
        Arc::new(inbound_registry(&plan)?),
        Arc::new(bus.clone()),
        Arc::new(dead_letters.clone()),
        receiver_config,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { dispatcher.run(shutdown).await }
    });
    let receiver_task = tokio::spawn(async move { receiver.run(shutdown_rx).await });

    tracing::info!(topic = %topic, "Booking bridge started");

    let script = [
        ("B1", BookingEvent::BookingCreated { booking_id: "B1".into(), table: 4 }),
        ("B2", BookingEvent::BookingCreated { booking_id: "B2".into(), table: 7 }),
        ("B1", BookingEvent::BookingCancelled { booking_id: "B1".into() }),
        ("B3", BookingEvent::BookingCreated { booking_id: "B3".into(), table: 2 }),
    ];

    let demo = async {
        for (booking_id, event) in &script {
            book(&bookings, booking_id, event).await?;
            tracing::info!(booking_id = %booking_id, event_type = event.event_type(), "Booking committed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // Wait until the facility has applied every message.
        while facility.inbox_entries().len() < script.len() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = tokio::time::timeout(Duration::from_secs(30), demo) => {
            result.context("demo timed out")??;
            tracing::info!("All bookings reached the facility service");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received");
        }
    }

    shutdown_tx.send(true)?;
    dispatcher_task.await?;
    receiver_task.await??;

    for booking_id in ["B1", "B2", "B3"] {
        let table = facility
            .get(&format!("table:{booking_id}"))
            .and_then(|v| v.try_into().ok())
            .map(u32::from_be_bytes);
        tracing::info!(booking_id = booking_id, table = ?table, "Facility table plan");
    }
    tracing::info!(
        published = bus.published().len(),
        dead_letters = dead_letters.len(),
        "Booking bridge stopped"
    );

    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        tracing::debug!(metrics = %rendered, "Final metrics");
    }

    Ok(())
}
