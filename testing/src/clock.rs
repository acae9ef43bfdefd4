//! Deterministic clocks.

use chrono::{DateTime, Duration, Utc};
use reliable_events_core::environment::Clock;
use std::sync::{Arc, Mutex, PoisonError};

/// Fixed clock for deterministic tests
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use reliable_events_testing::FixedClock;
/// use reliable_events_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can hand one clone to a store and keep another
/// to expire leases or make retries due.
///
/// ```
/// use reliable_events_testing::ManualClock;
/// use reliable_events_core::environment::Clock;
/// use chrono::Duration;
///
/// let clock = ManualClock::starting_at_epoch();
/// let before = clock.now();
/// clock.advance(Duration::seconds(30));
/// assert_eq!(clock.now() - before, Duration::seconds(30));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Clock stopped at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Clock stopped at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn starting_at_epoch() -> Self {
        Self::new(test_epoch())
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(test_epoch())
}
