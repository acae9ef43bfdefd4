//! Wire-level message types.
//!
//! A [`BusMessage`] is what actually crosses the broker. Its [`MessageId`] is the
//! identity the receiving inbox deduplicates on, so for outbox-originated messages it is
//! derived deterministically from the entry: publishing the same entry twice always
//! produces the same id.

use crate::codec::CodecError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for name-based message ids.
const MESSAGE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a3e_9b4d_5c7f_8e21_0d4a_b3c6_e5f7);

/// Unique identity of a bus message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Wrap an existing UUID (e.g. one supplied by a foreign producer).
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Random identity for messages that do not originate from an outbox entry.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic identity for an outbox entry.
    ///
    /// Built from `(event_type, aggregate_id, occurred_at, sequence)`; `sequence` is the
    /// monotonic outbox id, which disambiguates events of the same type raised for the
    /// same aggregate within one clock tick.
    ///
    /// # Examples
    ///
    /// ```
    /// use reliable_events_core::message::MessageId;
    /// use chrono::Utc;
    ///
    /// let at = Utc::now();
    /// let first = MessageId::for_outbox_entry("BookingCreated", "B1", at, 7);
    /// let again = MessageId::for_outbox_entry("BookingCreated", "B1", at, 7);
    /// assert_eq!(first, again);
    /// ```
    #[must_use]
    pub fn for_outbox_entry(
        event_type: &str,
        aggregate_id: &str,
        occurred_at: DateTime<Utc>,
        sequence: i64,
    ) -> Self {
        let name = format!(
            "{event_type}|{aggregate_id}|{}|{sequence}",
            occurred_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        );
        Self(Uuid::new_v5(&MESSAGE_ID_NAMESPACE, name.as_bytes()))
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Message headers carried next to the body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Links every message that belongs to the same business flow.
    pub correlation_id: Option<String>,
    /// Identity of the message or command that caused this one.
    pub causation_id: Option<String>,
    /// Broker partitioning key; the aggregate id for outbox messages, so one aggregate's
    /// events stay in one partition and keep their order.
    pub partition_key: String,
    /// When the underlying event happened in the producing context.
    pub occurred_at: DateTime<Utc>,
}

impl MessageHeaders {
    /// Headers with only the mandatory fields.
    #[must_use]
    pub fn new(partition_key: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id: None,
            causation_id: None,
            partition_key: partition_key.into(),
            occurred_at,
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// A message as it travels over the bus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Deduplication identity.
    pub message_id: MessageId,
    /// Stable logical type name, resolved through the mapper registries.
    pub event_type: String,
    /// Opaque body, encoded by the codec registered for `event_type`.
    pub body: Vec<u8>,
    /// Correlation, causation and partitioning metadata.
    pub headers: MessageHeaders,
}

impl BusMessage {
    /// Create a new bus message.
    #[must_use]
    pub fn new(
        message_id: MessageId,
        event_type: impl Into<String>,
        body: Vec<u8>,
        headers: MessageHeaders,
    ) -> Self {
        Self {
            message_id,
            event_type: event_type.into(),
            body,
            headers,
        }
    }

    /// Serialize the whole message into a broker record value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if encoding fails.
    pub fn to_envelope(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Parse a broker record value produced by [`BusMessage::to_envelope`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Deserialization`] if the record is not a valid envelope.
    pub fn from_envelope(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Deserialization(e.to_string()))
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BusMessage {{ id: {}, type: {}, size: {} bytes }}",
            self.message_id,
            self.event_type,
            self.body.len()
        )
    }
}
