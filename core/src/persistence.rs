//! Errors shared by every durable store (outbox, inbox, dead-letter sink).

use thiserror::Error;

/// Errors that can occur while talking to the local transactional store.
///
/// A `PersistenceError` is fatal to the *current* operation only. Callers retry at their
/// own level: the dispatcher on its next tick, the receiver through bus redelivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The enclosing transaction was already committed or rolled back.
    ///
    /// Outbox appends and inbox records are only valid inside a live transaction
    /// shared with the domain write they belong to.
    #[error("Transaction is not active")]
    TransactionInactive,

    /// Another in-flight transaction holds the row (e.g. the same message id is being
    /// processed concurrently). Safe to retry later.
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    /// The caller no longer holds the lease on an outbox entry: it lapsed and was taken
    /// over by another dispatcher, or the entry was settled meanwhile. The outcome was
    /// not written.
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    /// A row that was expected to exist is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored data could not be decoded (unknown status, corrupt metadata, ...).
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Database connection or query failure.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl PersistenceError {
    /// Whether retrying the same operation later can succeed.
    ///
    /// Corrupt records and missing rows will not heal by themselves.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::DatabaseError(_))
    }
}
