//! Outbox entry → bus message translation and send.

use crate::metrics::PublisherMetrics;
use reliable_events_core::bus::{MessageBus, TransportError};
use reliable_events_core::codec::CodecError;
use reliable_events_core::config::TopicNaming;
use reliable_events_core::message::{BusMessage, MessageHeaders, MessageId};
use reliable_events_core::outbox::OutboxEntry;
use reliable_events_core::registry::OutboundRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that can occur while publishing an outbox entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// No outbound binding exists for the entry's event type.
    #[error("No outbound binding for event type '{0}'")]
    Unroutable(String),

    /// The stored payload could not be turned into a wire body.
    #[error("Failed to encode '{event_type}': {source}")]
    Codec {
        /// Event type of the entry
        event_type: String,
        /// Underlying codec failure
        #[source]
        source: CodecError,
    },

    /// The bus rejected the message.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The bus did not confirm in time.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

impl PublishError {
    /// Whether a later attempt may succeed.
    ///
    /// A payload that fails to encode now will fail the same way forever. An unroutable
    /// type may become routable after a redeploy, so it is retried up to the attempt
    /// limit.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Codec { .. })
    }
}

/// Translates outbox entries into bus messages and sends them.
pub struct Publisher {
    registry: Arc<OutboundRegistry>,
    bus: Arc<dyn MessageBus>,
    naming: TopicNaming,
}

impl Publisher {
    /// Create a new publisher.
    #[must_use]
    pub fn new(registry: Arc<OutboundRegistry>, bus: Arc<dyn MessageBus>, naming: TopicNaming) -> Self {
        Self {
            registry,
            bus,
            naming,
        }
    }

    /// Build the topic and message for an entry without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Unroutable`] for an unbound event type and
    /// [`PublishError::Codec`] if the payload cannot be transcoded.
    pub fn to_message(&self, entry: &OutboxEntry) -> Result<(String, BusMessage), PublishError> {
        let binding = self
            .registry
            .resolve(&entry.event_type)
            .map_err(|_| PublishError::Unroutable(entry.event_type.clone()))?;

        let body = binding
            .encode_body(&entry.payload)
            .map_err(|source| PublishError::Codec {
                event_type: entry.event_type.clone(),
                source,
            })?;

        let mut headers = MessageHeaders::new(entry.aggregate_id.clone(), entry.occurred_at);
        headers.correlation_id.clone_from(&entry.metadata.correlation_id);
        headers.causation_id.clone_from(&entry.metadata.causation_id);

        let message = BusMessage::new(entry.message_id(), entry.event_type.clone(), body, headers);
        Ok((self.naming.topic_for(binding.topic()), message))
    }

    /// Publish an entry and return the message id it was sent with.
    ///
    /// # Errors
    ///
    /// Returns any [`PublishError`] except `Timeout`, which only the caller can impose.
    pub async fn publish(&self, entry: &OutboxEntry) -> Result<MessageId, PublishError> {
        let (topic, message) = self.to_message(entry)?;

        let started = Instant::now();
        self.bus.publish(&topic, &message).await?;
        PublisherMetrics::record_publish(&entry.event_type, started.elapsed());

        tracing::debug!(
            outbox_id = %entry.id,
            message_id = %message.message_id,
            event_type = %entry.event_type,
            topic = %topic,
            "Published outbox entry"
        );
        Ok(message.message_id)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("registry", &self.registry)
            .field("naming", &self.naming)
            .finish_non_exhaustive()
    }
}
