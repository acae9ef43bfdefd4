//! Prometheus metrics for the outbox dispatcher, publisher and receiver.
//!
//! Every counter carries an `event_type` label so a single noisy integration can be
//! told apart from the rest.
//!
//! # Example
//!
//! ```rust,no_run
//! use reliable_events_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use reliable_events_core::outbox::OutboxStats;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and start serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime; the HTTP exporter is spawned onto it.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or the listener cannot bind.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g. by another test) this logs a warning,
    /// leaves [`Self::handle`] empty and returns `Ok`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Outbox
    describe_counter!(
        "outbox_published_total",
        "Outbox entries published and marked as published"
    );
    describe_counter!(
        "outbox_failed_total",
        "Failed publish attempts that were scheduled for retry"
    );
    describe_counter!(
        "outbox_dead_total",
        "Outbox entries that exhausted their attempts or could never be published"
    );
    describe_gauge!(
        "outbox_entries",
        "Outbox entries by status, sampled once per dispatch cycle"
    );
    describe_histogram!(
        "dispatcher_cycle_duration_seconds",
        "Time taken by one claim-publish-mark cycle"
    );

    // Publisher
    describe_histogram!(
        "publisher_publish_duration_seconds",
        "Time taken for the bus to confirm a publish"
    );

    // Receiver
    describe_counter!(
        "receiver_processed_total",
        "Messages whose handler effects were committed"
    );
    describe_counter!(
        "receiver_duplicates_total",
        "Messages discarded because their id was already in the inbox"
    );
    describe_counter!(
        "receiver_dead_lettered_total",
        "Messages moved to the dead-letter sink"
    );
    describe_counter!(
        "receiver_retries_total",
        "Deliveries negatively acknowledged for redelivery"
    );
    describe_histogram!(
        "receiver_handler_duration_seconds",
        "Time taken to run an inbound handler"
    );

    // Dead-letter queue (recorded by the store implementations)
    describe_counter!(
        "dead_letter_added_total",
        "Rows written to the dead-letter queue"
    );
    describe_counter!(
        "dead_letter_resolved_total",
        "Dead letters marked as resolved by an operator"
    );
    describe_counter!(
        "dead_letter_discarded_total",
        "Dead letters permanently discarded by an operator"
    );
    describe_gauge!(
        "dead_letter_pending",
        "Dead letters awaiting an operator, sampled when counted"
    );
}

/// Outbox dispatcher metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a published entry.
    pub fn record_published(event_type: &str) {
        counter!("outbox_published_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a failed attempt that will be retried.
    pub fn record_failed(event_type: &str) {
        counter!("outbox_failed_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record an entry moved to `dead`.
    pub fn record_dead(event_type: &str) {
        counter!("outbox_dead_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record the duration of one dispatch cycle.
    pub fn record_cycle(duration: Duration) {
        histogram!("dispatcher_cycle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record the outbox backlog by status.
    #[allow(clippy::cast_precision_loss)] // Gauge values are f64
    pub fn record_stats(stats: &OutboxStats) {
        for (status, count) in [
            ("pending", stats.pending),
            ("failed", stats.failed),
            ("published", stats.published),
            ("dead", stats.dead),
        ] {
            gauge!("outbox_entries", "status" => status).set(count as f64);
        }
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a confirmed publish.
    pub fn record_publish(event_type: &str, duration: Duration) {
        histogram!("publisher_publish_duration_seconds", "event_type" => event_type.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Receiver metrics recorder.
pub struct ReceiverMetrics;

impl ReceiverMetrics {
    /// Record a committed message.
    pub fn record_processed(event_type: &str) {
        counter!("receiver_processed_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a discarded duplicate.
    pub fn record_duplicate(event_type: &str) {
        counter!("receiver_duplicates_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a delivery nacked because another consumer held the same message.
    pub fn record_contended(event_type: &str) {
        counter!("receiver_contended_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered(event_type: &str) {
        counter!("receiver_dead_lettered_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Record a nack.
    pub fn record_retry(event_type: &str) {
        counter!("receiver_retries_total", "event_type" => event_type.to_string()).increment(1);
    }

    /// Record a handler invocation.
    pub fn record_handler(event_type: &str, duration: Duration) {
        histogram!("receiver_handler_duration_seconds", "event_type" => event_type.to_string())
            .record(duration.as_secs_f64());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_outbox_and_receiver_metrics_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        OutboxMetrics::record_published("BookingCreated");
        OutboxMetrics::record_dead("BookingCreated");
        OutboxMetrics::record_stats(&OutboxStats {
            pending: 3,
            failed: 1,
            published: 10,
            dead: 1,
        });
        ReceiverMetrics::record_duplicate("FacilityClosed");
        ReceiverMetrics::record_handler("FacilityClosed", Duration::from_millis(5));

        // If another test installed the recorder first, this server has no handle.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("outbox_published_total"));
            assert!(rendered.contains("outbox_dead_total"));
            assert!(rendered.contains("outbox_entries"));
            assert!(rendered.contains("receiver_duplicates_total"));
            assert!(rendered.contains("receiver_handler_duration_seconds"));
        }
    }

    #[tokio::test]
    async fn test_second_start_is_tolerated() {
        let mut first = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        let mut second = MetricsServer::new("127.0.0.1:0".parse().unwrap());

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());
        assert!(first.handle().is_none() || second.handle().is_none());
    }
}
