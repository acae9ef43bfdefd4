//! # Reliable Events Runtime
//!
//! The moving parts of the outbox/inbox bridge.
//!
//! ## Components
//!
//! - **[`Dispatcher`]**: leases outbox batches, publishes them and records the outcome,
//!   with exponential backoff and a terminal `dead` status
//! - **[`Publisher`]**: turns an outbox entry into a bus message with a deterministic id
//! - **[`Receiver`]**: consumes messages through the inbox so each is applied once,
//!   dead-lettering what can never succeed
//! - **[`metrics`]**: Prometheus exporter and recorders
//!
//! ## Example
//!
//! ```ignore
//! use reliable_events_runtime::{Dispatcher, DispatcherConfig, Publisher};
//!
//! let publisher = Arc::new(Publisher::new(outbound, bus.clone(), config.topic_naming()));
//! let dispatcher = Dispatcher::new(store.clone(), publisher, DispatcherConfig::from_settings(&config));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! tokio::spawn(async move { dispatcher.run(shutdown_rx).await });
//! ```

/// Outbox dispatch loop
pub mod dispatcher;

/// Prometheus metrics for observability
pub mod metrics;

/// Outbox entry to bus message translation
pub mod publisher;

/// Idempotent inbound processing
pub mod receiver;

pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig};
pub use publisher::{PublishError, Publisher};
pub use receiver::{ReceiveOutcome, Receiver, ReceiverConfig};
