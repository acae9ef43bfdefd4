//! Transactional outbox.
//!
//! Domain code appends an entry in the *same* transaction as the state change that raised
//! the event, so either both become durable or neither does. The dispatcher later claims
//! entries under a time-bounded lease, publishes them and records the outcome.
//!
//! # Entry lifecycle
//!
//! ```text
//!            claim_batch            mark_published
//!  Pending ──────────────► leased ─────────────────► Published ──► purged after retention
//!     ▲                     │  │
//!     │       mark_failed   │  │ mark_dead
//!  Failed ◄─────────────────┘  └─────────────────► Dead ──► requeue_dead ──► Pending
//! ```
//!
//! Two traits split the surface by caller:
//!
//! - [`TransactionalOutbox`] - domain side, `append` inside a caller-owned transaction
//! - [`OutboxStore`] - dispatcher side, claim and record outcomes

use crate::backoff::BackoffPolicy;
use crate::codec::CodecError;
use crate::event::IntegrationEvent;
use crate::message::MessageId;
use crate::persistence::PersistenceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Monotonic outbox sequence number assigned by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutboxId(i64);

impl OutboxId {
    /// Wrap a raw sequence number.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw sequence number.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Publication status of an outbox entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    /// Never attempted
    Pending,
    /// Attempted at least once, scheduled for retry at `next_attempt_at`
    Failed,
    /// Delivered to the bus (terminal)
    Published,
    /// Gave up; waiting for manual inspection (terminal until re-queued)
    Dead,
}

impl OutboxStatus {
    /// Convert to the string stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Published => "published",
            Self::Dead => "dead",
        }
    }

    /// Parse from the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "failed" => Some(Self::Failed),
            "published" => Some(Self::Published),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }

    /// Whether the dispatcher will never touch the entry again on its own.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Dead)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation data carried from the outbox entry to the bus message headers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Business-flow correlation id
    pub correlation_id: Option<String>,
    /// Id of the command or message that caused the event
    pub causation_id: Option<String>,
}

impl EventMetadata {
    /// Metadata with a correlation id.
    #[must_use]
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            causation_id: None,
        }
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// An entry about to be appended by domain code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOutboxEntry {
    /// Logical type name; must be bound in the outbound registry to be publishable
    pub event_type: String,
    /// Aggregate that raised the event; ordering is preserved per aggregate
    pub aggregate_id: String,
    /// Event payload in the internal `bincode` encoding
    pub payload: Vec<u8>,
    /// When the event happened; `None` lets the store stamp it with its clock
    pub occurred_at: Option<DateTime<Utc>>,
    /// Correlation data
    pub metadata: EventMetadata,
}

impl NewOutboxEntry {
    /// Create an entry from an already-encoded payload.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            occurred_at: None,
            metadata: EventMetadata::default(),
        }
    }

    /// Create an entry from a typed event, encoding it with `bincode`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Serialization`] if the event cannot be encoded.
    pub fn from_event<E>(aggregate_id: impl Into<String>, event: &E) -> Result<Self, CodecError>
    where
        E: IntegrationEvent + Serialize,
    {
        Ok(Self::new(event.event_type(), aggregate_id, event.to_bytes()?))
    }

    /// Pin the occurrence time instead of letting the store stamp it.
    #[must_use]
    pub const fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Attach correlation data.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A stored outbox entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Monotonic id
    pub id: OutboxId,
    /// Logical type name
    pub event_type: String,
    /// Owning aggregate
    pub aggregate_id: String,
    /// Payload in the internal encoding
    pub payload: Vec<u8>,
    /// When the event happened
    pub occurred_at: DateTime<Utc>,
    /// Correlation data
    pub metadata: EventMetadata,
    /// Current status
    pub status: OutboxStatus,
    /// Number of failed publish attempts so far
    pub attempt_count: u32,
    /// Error from the most recent failed attempt
    pub last_error: Option<String>,
    /// Earliest time the entry may be claimed again
    pub next_attempt_at: DateTime<Utc>,
    /// Dispatcher instance currently holding the lease
    pub lease_owner: Option<String>,
    /// When the lease lapses
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// When the entry reached `Published`
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Deterministic bus message id for this entry.
    ///
    /// Re-publishing the entry (after a crash or lease expiry) yields the same id, which
    /// is what lets the receiving inbox discard the duplicate.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        MessageId::for_outbox_entry(
            &self.event_type,
            &self.aggregate_id,
            self.occurred_at,
            self.id.value(),
        )
    }

    /// Whether the entry is `Published` or `Dead`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether someone holds an unexpired lease at `now`.
    #[must_use]
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|expires| expires > now)
    }
}

/// Entry counts per status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    /// Never attempted
    pub pending: u64,
    /// Waiting for a retry
    pub failed: u64,
    /// Delivered, not yet purged
    pub published: u64,
    /// Given up
    pub dead: u64,
}

impl OutboxStats {
    /// Entries the dispatcher still has to deliver.
    #[must_use]
    pub const fn backlog(&self) -> u64 {
        self.pending + self.failed
    }
}

/// Domain-side outbox access.
///
/// `append` only accepts a live transaction of the same store as the domain write, so the
/// entry and the state change commit or roll back together.
pub trait TransactionalOutbox: Send + Sync {
    /// Store transaction handle shared with the domain write.
    type Transaction: Send;

    /// Append an entry inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionInactive`] if `tx` was already committed or
    /// rolled back, or [`PersistenceError::DatabaseError`] if the write fails.
    fn append<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        entry: NewOutboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxId, PersistenceError>> + Send + 'a>>;
}

/// Dispatcher-side outbox access.
///
/// # Claim rule
///
/// `claim_batch` returns at most `limit` entries ordered by `(occurred_at, id)` that are
/// `Pending` or `Failed`, due (`next_attempt_at <= now`), not under an unexpired lease,
/// and not preceded by another non-terminal entry of the same aggregate outside the
/// returned set. Claiming is atomic: concurrent callers never receive the same entry
/// while its lease is live.
///
/// # Lease ownership
///
/// Outcomes are written only by the current lease owner. Once a lease lapses another
/// dispatcher may claim the entry, after which the previous owner's `mark_*` calls fail
/// with [`PersistenceError::LeaseLost`] and its `release` is a no-op.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the store can be shared as
/// `Arc<dyn OutboxStore>`.
pub trait OutboxStore: Send + Sync {
    /// Lease up to `limit` eligible entries to `owner` for `lease`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn claim_batch<'a>(
        &'a self,
        owner: &'a str,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + 'a>>;

    /// Mark entries as published and drop their leases.
    ///
    /// Only entries whose lease is held by `owner` are written.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::LeaseLost`] if any entry is not leased to `owner`
    /// (the others are still marked), or [`PersistenceError`] if the store is unavailable.
    fn mark_published<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>>;

    /// Record a failed attempt and schedule the retry.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::LeaseLost`] if the entry is not leased to `owner`,
    /// or [`PersistenceError::NotFound`] for an unknown id.
    fn mark_failed<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
        backoff: &'a BackoffPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>>;

    /// Record a final failed attempt and give up on the entry.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::LeaseLost`] if the entry is not leased to `owner`,
    /// or [`PersistenceError::NotFound`] for an unknown id.
    fn mark_dead<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>>;

    /// Drop `owner`'s leases without counting an attempt.
    ///
    /// Entries leased to someone else are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn release<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>>;

    /// Entry counts per status.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<OutboxStats, PersistenceError>> + Send + '_>>;

    /// Dead entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn list_dead(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + '_>>;

    /// Reset a dead entry to `Pending` with a zero attempt count.
    ///
    /// Returns `false` if the entry does not exist or is not `Dead`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn requeue_dead(
        &self,
        id: OutboxId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>>;

    /// Delete published entries whose `published_at` is before `older_than`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the store is unavailable.
    fn purge_published(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>>;
}
