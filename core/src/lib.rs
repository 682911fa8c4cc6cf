//! # Hound Core
//!
//! Core traits and types for the Hound command pipeline.
//!
//! A user-originated command travels through four stages:
//!
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────────┐    ┌─────────────┐
//! │  Inbound    │───▶│   Durable    │───▶│   Idempotent     │───▶│   Reply     │
//! │  event      │    │   queue      │    │   mutation       │    │   queue     │
//! └─────────────┘    └──────────────┘    └──────────────────┘    └─────────────┘
//!   classify +         at-least-once        at-most-once           best-effort
//!   key derivation     prefetch = 1         per idempotency key    delivery
//! ```
//!
//! This crate holds everything that is shared by the stages and has no I/O of
//! its own:
//!
//! - [`idempotency`]: deterministic key derivation from external event ids
//! - [`envelope`]: the flat wire shapes placed on queues
//! - [`queue`]: the [`DurableQueue`](queue::DurableQueue) broker abstraction
//! - [`command`]: the closed intent type produced from classifier output
//! - [`todo`]: the domain model
//! - [`store`]: the persistent store boundary
//! - [`collaborator`]: boundaries to the classifier and notification sender
//! - [`error`]: the domain and validation error taxonomy
//! - [`environment`]: injected clock

pub mod collaborator;
pub mod command;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod queue;
pub mod store;
pub mod todo;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use idempotency::{IdempotencyKey, generate_key};

/// Environment module - injected dependencies for deterministic tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use hound_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
