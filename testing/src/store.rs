//! In-memory transactional store.
//!
//! One [`InMemoryStore`] plays the role of the local database of a bounded context: it
//! holds domain records, the outbox and the inbox, and gives them a shared transaction
//! so the same atomicity rules apply as with `PostgreSQL`.
//!
//! Transactions are handles ([`InMemoryTransaction`]) whose writes are staged until
//! commit. A handle can be cloned and kept after commit or rollback; any later use fails
//! with [`PersistenceError::TransactionInactive`].

use chrono::{DateTime, Utc};
use reliable_events_core::backoff::BackoffPolicy;
use reliable_events_core::environment::{Clock, SystemClock};
use reliable_events_core::inbox::{InboxEntry, InboxStore, RecordOutcome};
use reliable_events_core::message::MessageId;
use reliable_events_core::outbox::{
    NewOutboxEntry, OutboxEntry, OutboxId, OutboxStats, OutboxStatus, OutboxStore,
    TransactionalOutbox,
};
use reliable_events_core::persistence::PersistenceError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Handle of a live (or finished) in-memory transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryTransaction {
    id: u64,
}

#[derive(Debug, Default)]
struct Staged {
    outbox: Vec<OutboxEntry>,
    inbox: Vec<InboxEntry>,
    writes: Vec<(String, Option<Vec<u8>>)>,
}

#[derive(Debug, Default)]
struct StoreState {
    next_outbox_id: i64,
    next_tx_id: u64,
    outbox: BTreeMap<OutboxId, OutboxEntry>,
    inbox: HashMap<MessageId, InboxEntry>,
    records: HashMap<String, Vec<u8>>,
    live: HashMap<u64, Staged>,
    recording: HashMap<MessageId, u64>,
    failing_commits: u32,
}

impl StoreState {
    fn staged(&mut self, tx: &InMemoryTransaction) -> Result<&mut Staged, PersistenceError> {
        self.live
            .get_mut(&tx.id)
            .ok_or(PersistenceError::TransactionInactive)
    }

    fn entry_mut(&mut self, id: OutboxId) -> Result<&mut OutboxEntry, PersistenceError> {
        self.outbox
            .get_mut(&id)
            .ok_or_else(|| PersistenceError::NotFound(format!("outbox entry {id}")))
    }

    /// The entry, if `owner` holds its lease.
    fn leased_mut(&mut self, owner: &str, id: OutboxId) -> Result<&mut OutboxEntry, PersistenceError> {
        let entry = self.entry_mut(id)?;
        if entry.lease_owner.as_deref() == Some(owner) {
            Ok(entry)
        } else {
            Err(PersistenceError::LeaseLost(format!("outbox entry {id}")))
        }
    }

    fn forget_recordings(&mut self, tx_id: u64) {
        self.recording.retain(|_, owner| *owner != tx_id);
    }
}

/// In-memory store implementing [`TransactionalOutbox`], [`OutboxStore`] and
/// [`InboxStore`] over one shared state.
///
/// Cloning is cheap and clones share state, like pool handles.
///
/// # Example
///
/// ```
/// use reliable_events_testing::InMemoryStore;
/// use reliable_events_core::outbox::{NewOutboxEntry, TransactionalOutbox};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStore::new();
/// let mut tx = store.begin_transaction();
/// store.put(&mut tx, "booking:B1", b"confirmed".to_vec()).unwrap();
/// store
///     .append(&mut tx, NewOutboxEntry::new("BookingCreated", "B1", vec![]))
///     .await
///     .unwrap();
/// store.commit_transaction(tx).unwrap();
///
/// assert_eq!(store.outbox_entries().len(), 1);
/// assert_eq!(store.get("booking:B1"), Some(b"confirmed".to_vec()));
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Store stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store stamped by the given clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                next_outbox_id: 1,
                next_tx_id: 1,
                ..StoreState::default()
            })),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a transaction.
    #[must_use]
    pub fn begin_transaction(&self) -> InMemoryTransaction {
        let mut state = self.lock();
        let id = state.next_tx_id;
        state.next_tx_id += 1;
        state.live.insert(id, Staged::default());
        InMemoryTransaction { id }
    }

    /// Apply every write staged in `tx` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionInactive`] for a finished transaction, or
    /// [`PersistenceError::DatabaseError`] when a commit failure was injected with
    /// [`fail_next_commits`](Self::fail_next_commits). A failed commit discards the
    /// transaction.
    pub fn commit_transaction(&self, tx: InMemoryTransaction) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        let staged = state
            .live
            .remove(&tx.id)
            .ok_or(PersistenceError::TransactionInactive)?;
        state.forget_recordings(tx.id);

        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(PersistenceError::DatabaseError(
                "injected commit failure".to_string(),
            ));
        }

        for entry in staged.outbox {
            state.outbox.insert(entry.id, entry);
        }
        for entry in staged.inbox {
            state.inbox.insert(entry.message_id, entry);
        }
        for (key, value) in staged.writes {
            match value {
                Some(value) => state.records.insert(key, value),
                None => state.records.remove(&key),
            };
        }
        Ok(())
    }

    /// Discard every write staged in `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionInactive`] for a finished transaction.
    pub fn rollback_transaction(&self, tx: InMemoryTransaction) -> Result<(), PersistenceError> {
        let mut state = self.lock();
        state
            .live
            .remove(&tx.id)
            .ok_or(PersistenceError::TransactionInactive)?;
        state.forget_recordings(tx.id);
        Ok(())
    }

    /// Stage a domain record write.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionInactive`] for a finished transaction.
    pub fn put(
        &self,
        tx: &mut InMemoryTransaction,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<(), PersistenceError> {
        self.lock().staged(tx)?.writes.push((key.into(), Some(value)));
        Ok(())
    }

    /// Stage a domain record deletion.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionInactive`] for a finished transaction.
    pub fn delete(&self, tx: &mut InMemoryTransaction, key: &str) -> Result<(), PersistenceError> {
        self.lock().staged(tx)?.writes.push((key.to_string(), None));
        Ok(())
    }

    /// Read a record as seen inside `tx` (staged writes win over committed state).
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::TransactionInactive`] for a finished transaction.
    pub fn get_in(
        &self,
        tx: &InMemoryTransaction,
        key: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let mut state = self.lock();
        let staged = state
            .staged(tx)?
            .writes
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone());
        Ok(staged.unwrap_or_else(|| state.records.get(key).cloned()))
    }

    /// Read a committed record.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().records.get(key).cloned()
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: u32) {
        self.lock().failing_commits = count;
    }

    /// Committed outbox entries in id order.
    #[must_use]
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.lock().outbox.values().cloned().collect()
    }

    /// One committed outbox entry.
    #[must_use]
    pub fn outbox_entry(&self, id: OutboxId) -> Option<OutboxEntry> {
        self.lock().outbox.get(&id).cloned()
    }

    /// Committed inbox rows.
    #[must_use]
    pub fn inbox_entries(&self) -> Vec<InboxEntry> {
        let mut entries: Vec<InboxEntry> = self.lock().inbox.values().cloned().collect();
        entries.sort_by_key(|e| (e.processed_at, e.message_id));
        entries
    }

    fn claim(&self, owner: &str, limit: usize, lease: Duration) -> Vec<OutboxEntry> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let expires = now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut state = self.lock();
        let mut ordered: Vec<(DateTime<Utc>, OutboxId)> = state
            .outbox
            .values()
            .filter(|e| !e.is_terminal())
            .map(|e| (e.occurred_at, e.id))
            .collect();
        ordered.sort_unstable();

        let mut blocked: HashSet<String> = HashSet::new();
        let mut claimed = Vec::new();
        for (_, id) in ordered {
            if claimed.len() >= limit {
                break;
            }
            let Some(entry) = state.outbox.get_mut(&id) else {
                continue;
            };
            if blocked.contains(&entry.aggregate_id) {
                continue;
            }
            let due = entry.next_attempt_at <= now && !entry.is_leased_at(now);
            if !due {
                blocked.insert(entry.aggregate_id.clone());
                continue;
            }
            entry.lease_owner = Some(owner.to_string());
            entry.lease_expires_at = Some(expires);
            claimed.push(entry.clone());
        }
        claimed
    }
}

impl TransactionalOutbox for InMemoryStore {
    type Transaction = InMemoryTransaction;

    fn append<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        entry: NewOutboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxId, PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.lock();
            state.staged(tx)?;

            let id = OutboxId::new(state.next_outbox_id);
            state.next_outbox_id += 1;
            let occurred_at = entry.occurred_at.unwrap_or(now);
            let stored = OutboxEntry {
                id,
                event_type: entry.event_type,
                aggregate_id: entry.aggregate_id,
                payload: entry.payload,
                occurred_at,
                metadata: entry.metadata,
                status: OutboxStatus::Pending,
                attempt_count: 0,
                last_error: None,
                next_attempt_at: occurred_at.min(now),
                lease_owner: None,
                lease_expires_at: None,
                published_at: None,
            };
            state.staged(tx)?.outbox.push(stored);
            Ok(id)
        })
    }
}

impl OutboxStore for InMemoryStore {
    fn claim_batch<'a>(
        &'a self,
        owner: &'a str,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + 'a>>
    {
        Box::pin(async move { Ok(self.claim(owner, limit, lease)) })
    }

    fn mark_published<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.lock();
            let mut lost = Vec::new();
            for id in ids {
                match state.leased_mut(owner, *id) {
                    Ok(entry) => {
                        entry.status = OutboxStatus::Published;
                        entry.published_at = Some(now);
                        entry.lease_owner = None;
                        entry.lease_expires_at = None;
                    }
                    Err(_) => lost.push(id.to_string()),
                }
            }
            if lost.is_empty() {
                Ok(())
            } else {
                Err(PersistenceError::LeaseLost(format!("outbox entries {}", lost.join(", "))))
            }
        })
    }

    fn mark_failed<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
        backoff: &'a BackoffPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.lock();
            let entry = state.leased_mut(owner, id)?;
            entry.attempt_count = entry.attempt_count.saturating_add(1);
            entry.status = OutboxStatus::Failed;
            entry.last_error = Some(error.to_string());
            entry.next_attempt_at = backoff.next_attempt_at(entry.attempt_count, now);
            entry.lease_owner = None;
            entry.lease_expires_at = None;
            Ok(())
        })
    }

    fn mark_dead<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            let entry = state.leased_mut(owner, id)?;
            entry.attempt_count = entry.attempt_count.saturating_add(1);
            entry.status = OutboxStatus::Dead;
            entry.last_error = Some(error.to_string());
            entry.lease_owner = None;
            entry.lease_expires_at = None;
            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            for id in ids {
                if let Ok(entry) = state.leased_mut(owner, *id) {
                    entry.lease_owner = None;
                    entry.lease_expires_at = None;
                }
            }
            Ok(())
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<OutboxStats, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.lock();
            let mut stats = OutboxStats::default();
            for entry in state.outbox.values() {
                match entry.status {
                    OutboxStatus::Pending => stats.pending += 1,
                    OutboxStatus::Failed => stats.failed += 1,
                    OutboxStatus::Published => stats.published += 1,
                    OutboxStatus::Dead => stats.dead += 1,
                }
            }
            Ok(stats)
        })
    }

    fn list_dead(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self.lock();
            Ok(state
                .outbox
                .values()
                .filter(|e| e.status == OutboxStatus::Dead)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn requeue_dead(
        &self,
        id: OutboxId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.lock();
            match state.outbox.get_mut(&id) {
                Some(entry) if entry.status == OutboxStatus::Dead => {
                    entry.status = OutboxStatus::Pending;
                    entry.attempt_count = 0;
                    entry.next_attempt_at = now;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn purge_published(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock();
            let before = state.outbox.len();
            state.outbox.retain(|_, e| {
                !(e.status == OutboxStatus::Published
                    && e.published_at.is_some_and(|at| at < older_than))
            });
            Ok((before - state.outbox.len()) as u64)
        })
    }
}

impl InboxStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    fn begin(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Transaction, PersistenceError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.begin_transaction()) })
    }

    fn record<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        entry: &'a InboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.staged(tx)?;

            if state.inbox.contains_key(&entry.message_id) {
                return Ok(RecordOutcome::Duplicate);
            }
            match state.recording.get(&entry.message_id) {
                Some(owner) if *owner == tx.id => return Ok(RecordOutcome::Duplicate),
                Some(_) => {
                    return Err(PersistenceError::Conflict(format!(
                        "message {} is being processed by another transaction",
                        entry.message_id
                    )));
                }
                None => {}
            }

            state.recording.insert(entry.message_id, tx.id);
            state.staged(tx)?.inbox.push(entry.clone());
            Ok(RecordOutcome::Recorded)
        })
    }

    fn contains(
        &self,
        message_id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock().inbox.contains_key(&message_id)) })
    }

    fn commit(
        &self,
        tx: Self::Transaction,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move { self.commit_transaction(tx) })
    }

    fn rollback(
        &self,
        tx: Self::Transaction,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move { self.rollback_transaction(tx) })
    }

    fn purge_processed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock();
            let before = state.inbox.len();
            state.inbox.retain(|_, e| e.processed_at >= older_than);
            Ok((before - state.inbox.len()) as u64)
        })
    }
}
