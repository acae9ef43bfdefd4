//! # Reliable Events Testing
//!
//! In-memory fakes and helpers for testing the outbox/inbox pipeline without a database
//! or broker.
//!
//! This crate provides:
//! - [`InMemoryStore`]: transactional store with domain records, outbox and inbox
//! - [`InMemoryBus`]: message bus with redelivery on nack and failure injection
//! - [`InMemoryDeadLetterSink`]: dead-letter collection
//! - [`ManualClock`] / [`FixedClock`]: deterministic time
//! - [`strategies`]: proptest strategies for event workloads
//!
//! ## Example
//!
//! ```
//! use reliable_events_testing::{InMemoryStore, ManualClock};
//! use reliable_events_core::outbox::{NewOutboxEntry, OutboxStore, TransactionalOutbox};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let clock = ManualClock::starting_at_epoch();
//! let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
//!
//! let mut tx = store.begin_transaction();
//! store.append(&mut tx, NewOutboxEntry::new("BookingCreated", "B1", vec![])).await.unwrap();
//! store.commit_transaction(tx).unwrap();
//!
//! let claimed = store.claim_batch("dispatcher-1", 10, Duration::from_secs(30)).await.unwrap();
//! assert_eq!(claimed.len(), 1);
//! # });
//! ```

pub mod bus;
pub mod clock;
pub mod dead_letter;
pub mod store;

/// Property-based testing strategies.
pub mod strategies {
    use proptest::prelude::*;

    /// A workload of `(aggregate_id, sequence_within_aggregate)` pairs in append order.
    ///
    /// Aggregates are drawn from a small pool so that ordering constraints between
    /// entries of the same aggregate actually matter.
    pub fn aggregate_workload(max_len: usize) -> impl Strategy<Value = Vec<(String, u32)>> {
        prop::collection::vec(0u8..4, 1..=max_len).prop_map(|picks| {
            let mut counters = [0u32; 4];
            picks
                .into_iter()
                .map(|pick| {
                    let slot = usize::from(pick);
                    counters[slot] += 1;
                    (format!("B{pick}"), counters[slot])
                })
                .collect()
        })
    }

    /// Interleaving of two dispatchers: `true` runs the first one next.
    pub fn interleaving(max_len: usize) -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 1..=max_len)
    }
}

// Re-export commonly used items
pub use bus::InMemoryBus;
pub use clock::{FixedClock, ManualClock, test_clock, test_epoch};
pub use dead_letter::InMemoryDeadLetterSink;
pub use store::{InMemoryStore, InMemoryTransaction};
