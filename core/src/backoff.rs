//! Exponential backoff with a cap and jitter for outbox retries.
//!
//! The dispatcher does not sleep between attempts. A failed entry is rescheduled by
//! setting its `next_attempt_at`, and the store keeps it out of `claim_batch` until then.
//!
//! # Example
//!
//! ```rust
//! use reliable_events_core::backoff::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::builder()
//!     .initial_delay(Duration::from_millis(500))
//!     .max_delay(Duration::from_secs(60))
//!     .multiplier(2.0)
//!     .jitter(0.0)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
//! ```

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration.
///
/// # Default Values
///
/// - `initial_delay`: 1 second
/// - `max_delay`: 5 minutes
/// - `multiplier`: 2.0 (delay doubles each attempt)
/// - `jitter`: 0.2 (up to 20% shaved off each delay)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Cap for exponential growth
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts
    pub multiplier: f64,
    /// Fraction of the delay that is randomised away, in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            initial_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: None,
        }
    }

    /// Un-jittered delay after the given (1-based) failed attempt.
    ///
    /// `delay = initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    /// Attempt `0` is treated like attempt `1`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )] // Millisecond delays are far below f64 precision limits
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Jittered delay after the given failed attempt.
    ///
    /// The result lies in `[delay * (1 - jitter), delay]`, so the cap is never exceeded
    /// and concurrent dispatchers retrying the same broker outage spread out.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = usable_jitter(self.jitter);
        if jitter == 0.0 {
            return base;
        }

        let shave = rng.gen_range(0.0..=jitter);
        let millis = base.as_millis() as f64 * (1.0 - shave);
        Duration::from_millis(millis as u64)
    }

    /// When an entry that just failed its `attempt`-th time becomes eligible again.
    #[must_use]
    pub fn next_attempt_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.jittered_delay(attempt, &mut rand::thread_rng());
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Jitter clamped to `0.0..=1.0`; NaN and infinities disable it.
fn usable_jitter(jitter: f64) -> f64 {
    if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

impl BackoffPolicyBuilder {
    /// Set delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Set the jitter fraction, clamped to `0.0..=1.0`. A non-finite value means no jitter.
    #[must_use]
    pub const fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.map_or(defaults.jitter, usable_jitter),
        }
    }
}
