//! # Hound Testing
//!
//! In-memory doubles for every boundary of the Hound command pipeline.
//!
//! This crate provides:
//! - [`InMemoryQueue`]: a prefetch-one durable queue with failure injection
//! - [`InMemoryTodoRepository`]: a todo store that counts mutations
//! - [`ScriptedClassifier`] and [`RecordingNotifier`]: collaborator stubs
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use hound_testing::{InMemoryQueue, InMemoryTodoRepository, ScriptedClassifier, test_clock};
//!
//! #[tokio::test]
//! async fn buy_milk() {
//!     let queue = InMemoryQueue::new();
//!     let repo = InMemoryTodoRepository::new();
//!     let classifier = ScriptedClassifier::new().answer("buy milk", create("buy milk"));
//!     // wire producer, consumer and handler, then assert on queue.published(...)
//! }
//! ```

pub mod collaborators;
pub mod queue;
pub mod repository;

use chrono::{DateTime, Utc};
use hound_core::environment::Clock;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until advanced, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use hound_testing::mocks::FixedClock;
    /// use hound_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward; clones observe the change.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a test log subscriber that honours `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use collaborators::{RecordingNotifier, ScriptedClassifier, SentMessage};
pub use mocks::{FixedClock, test_clock};
pub use queue::{InMemoryConsumer, InMemoryQueue};
pub use repository::InMemoryTodoRepository;
