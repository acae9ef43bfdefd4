//! # Reliable Events Core
//!
//! Core traits and types for reliable, effectively-once event propagation between
//! bounded contexts.
//!
//! This crate provides the abstractions shared by every side of the pipeline:
//!
//! ```text
//!  domain write ──► [ Outbox ] ──► Dispatcher ──► Publisher ──► Message Bus
//!   (same tx)                                                       │
//!                                                                   ▼
//!  local handler ◄── Inbound Registry ◄── [ Inbox check ] ◄── Receiver
//!   (same tx as inbox row)
//! ```
//!
//! ## Core Concepts
//!
//! - **Outbox**: events are appended in the same transaction as the state change that
//!   raised them ([`outbox`])
//! - **Inbox**: processed message identities, written in the same transaction as the
//!   handler's effects ([`inbox`])
//! - **Mapper registries**: closed sets of `event_type → codec + topic/handler` bindings,
//!   built once at startup ([`registry`])
//! - **Message bus**: at-least-once transport with explicit ack/nack ([`bus`])
//! - **Dead letters**: poison messages are contained instead of retried forever
//!   ([`dead_letter`])
//!
//! ## Delivery Guarantees
//!
//! - Publishing is **at-least-once**: a crash between send and `mark_published` leads to
//!   a re-send with the *same* [`MessageId`](message::MessageId)
//! - Consumption is **idempotent**: the inbox uniqueness constraint turns duplicates into
//!   no-ops
//! - Ordering holds **per aggregate**, never across aggregates

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod backoff;
pub mod bus;
pub mod codec;
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod inbox;
pub mod message;
pub mod outbox;
pub mod persistence;
pub mod registry;

/// Environment module - injected time source
///
/// Everything that stamps or compares time (`occurred_at`, lease expiry, retry
/// eligibility) reads it through [`Clock`](environment::Clock) so tests can move time
/// explicitly.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use reliable_events_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
