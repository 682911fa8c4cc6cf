//! Bounded redelivery with exponential backoff.
//!
//! A message whose handler fails transiently is requeued, so the broker
//! delivers it again with its attempt counter incremented. [`RetryPolicy`]
//! caps how many times that may happen and how long the consumer waits before
//! handing the message back.
//!
//! # Example
//!
//! ```rust
//! use hound_runtime::retry::{RetryDecision, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(
//!     policy.decide(1, true),
//!     RetryDecision::Requeue { delay: Duration::from_millis(100) }
//! );
//! assert_eq!(policy.decide(3, true), RetryDecision::Exhausted);
//! assert_eq!(policy.decide(1, false), RetryDecision::Exhausted);
//! ```

use std::time::Duration;

/// Retry policy configuration for redelivery.
///
/// # Default Values
///
/// - `max_attempts`: 5 (0 means unbounded)
/// - `initial_delay`: 200ms
/// - `max_delay`: 10 seconds
/// - `multiplier`: 2.0 (delay doubles each attempt)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total deliveries allowed before a message is dead-lettered (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the first redelivery
    pub initial_delay: Duration,
    /// Maximum delay between deliveries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then hand the message back for another attempt.
    Requeue {
        /// Backoff before requeueing.
        delay: Duration,
    },
    /// Give up on the message.
    Exhausted,
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Policy that never gives up and never waits.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )] // Millisecond delays are far below f64 precision limits
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms.max(0.0) as u64)
        }
    }

    /// Whether another delivery is allowed after `attempt`.
    #[must_use]
    pub const fn allows_another(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Decide the fate of a message whose `attempt`-th delivery failed.
    #[must_use]
    pub fn decide(&self, attempt: u32, transient: bool) -> RetryDecision {
        if transient && self.allows_another(attempt) {
            RetryDecision::Requeue {
                delay: self.delay_for_attempt(attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set the total number of deliveries (0 = unbounded).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set delay before the first redelivery.
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

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(5),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(200)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(10)),
            multiplier: self.multiplier.unwrap_or(2.0),
        }
    }
}
