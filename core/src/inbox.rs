//! Inbox (deduplication ledger).
//!
//! The receiver records a message's id in the same transaction that carries the
//! handler's side effects. The row is inserted *before* the handler runs:
//!
//! - a duplicate insert means the message was already handled, so the handler is skipped
//! - a handler failure rolls the row back together with the partial effects
//!
//! Presence of a row therefore always implies the handler committed.

use crate::message::MessageId;
use crate::persistence::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// A processed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    /// Identity of the processed message
    pub message_id: MessageId,
    /// Its logical type
    pub event_type: String,
    /// When processing committed
    pub processed_at: DateTime<Utc>,
}

impl InboxEntry {
    /// Create a new inbox entry.
    #[must_use]
    pub fn new(message_id: MessageId, event_type: impl Into<String>, processed_at: DateTime<Utc>) -> Self {
        Self {
            message_id,
            event_type: event_type.into(),
            processed_at,
        }
    }
}

/// Result of an insert-if-absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The row was inserted in this transaction.
    Recorded,
    /// A committed row with the same message id already exists.
    Duplicate,
}

/// Durable record of processed message identities.
///
/// Implementations enforce uniqueness of `message_id`. A concurrent in-flight insert of
/// the same id must not yield [`RecordOutcome::Recorded`] twice: it either blocks until
/// the other transaction finishes or fails with [`PersistenceError::Conflict`].
pub trait InboxStore: Send + Sync {
    /// Transaction shared by the inbox row and the handler's effects.
    type Transaction: Send;

    /// Start a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<Self::Transaction, PersistenceError>> + Send + '_>>;

    /// Insert `entry` inside `tx` unless its message id is already present.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Conflict`] if another live transaction is recording the
    /// same id, or [`PersistenceError::TransactionInactive`] for a finished transaction.
    fn record<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        entry: &'a InboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, PersistenceError>> + Send + 'a>>;

    /// Whether a committed row exists for `message_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn contains(
        &self,
        message_id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>>;

    /// Commit `tx`, making the inbox row and the handler's effects durable together.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the commit fails; nothing from `tx` is durable then.
    fn commit(
        &self,
        tx: Self::Transaction,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Discard `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store reports a failure while rolling back.
    fn rollback(
        &self,
        tx: Self::Transaction,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>>;

    /// Delete rows processed before `older_than`; returns how many were removed.
    ///
    /// Only safe once the bus can no longer redeliver messages that old.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn purge_processed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>>;
}
