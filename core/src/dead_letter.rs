//! Dead-letter sink for messages that can never be processed.

use crate::message::{BusMessage, MessageId};
use crate::persistence::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// A message that was taken out of circulation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Identity of the original message
    pub message_id: MessageId,
    /// Its logical type (possibly one nobody registered)
    pub event_type: String,
    /// The undecoded body
    pub body: Vec<u8>,
    /// Why processing gave up
    pub failure_reason: String,
    /// When the message was dead-lettered
    pub received_at: DateTime<Utc>,
    /// Topic it arrived on, if known
    pub topic: Option<String>,
    /// Deliveries seen before giving up
    pub attempts: u32,
}

impl DeadLetter {
    /// Build a dead letter from a received message.
    #[must_use]
    pub fn from_message(
        message: &BusMessage,
        topic: Option<&str>,
        failure_reason: impl Into<String>,
        attempts: u32,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message.message_id,
            event_type: message.event_type.clone(),
            body: message.body.clone(),
            failure_reason: failure_reason.into(),
            received_at,
            topic: topic.map(str::to_string),
            attempts,
        }
    }
}

/// Durable destination for dead letters.
///
/// The receiver acknowledges a poison message only after `send` succeeded, so a sink
/// failure leads to redelivery rather than loss.
pub trait DeadLetterSink: Send + Sync {
    /// Persist a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the dead letter could not be stored.
    fn send<'a>(
        &'a self,
        dead_letter: &'a DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>>;
}
