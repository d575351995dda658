//! # idproxy testing
//!
//! Testing utilities for the idproxy credential stores.
//!
//! This crate provides:
//! - Deterministic implementations of the environment traits (clocks, ID generators)
//! - [`InMemoryDocumentStore`], a complete in-memory persistence port with
//!   fault injection
//!
//! ## Example
//!
//! ```ignore
//! use idproxy_testing::{InMemoryDocumentStore, test_clock};
//!
//! #[tokio::test]
//! async fn test_rotation() {
//!     let db = InMemoryDocumentStore::new();
//!     let store = RefreshTokenStore::new(Arc::new(db.clone()), Arc::new(test_clock()));
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use idproxy_core::environment::{Clock, IdGenerationError, IdGenerator};

pub mod document_store;

pub use document_store::InMemoryDocumentStore;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerationError, IdGenerator, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use idproxy_testing::mocks::FixedClock;
    /// use idproxy_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
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

    /// Clock that only moves when a test moves it.
    ///
    /// Clones share the same instant, so a test can keep a handle while the
    /// store under test holds another.
    ///
    /// ```
    /// use idproxy_testing::mocks::ManualClock;
    /// use idproxy_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = ManualClock::new(Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::hours(1));
    /// assert_eq!(clock.now() - before, Duration::hours(1));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward (or backward, with a negative duration).
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute instant.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Predictable IDs: `{prefix}-1`, `{prefix}-2`, ...
    #[derive(Debug)]
    pub struct SequentialIdGenerator {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Create a generator whose IDs start with `prefix`.
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }
    }

    impl IdGenerator for SequentialIdGenerator {
        fn next_id(&self) -> Result<String, IdGenerationError> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{n}", self.prefix))
        }
    }

    /// Generator that always fails, for exercising error paths.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FailingIdGenerator;

    impl IdGenerator for FailingIdGenerator {
        fn next_id(&self) -> Result<String, IdGenerationError> {
            Err(IdGenerationError("entropy source unavailable".to_string()))
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_instant())
    }

    /// The instant used by [`test_clock`] (2025-01-01 00:00:00 UTC).
    ///
    /// # Panics
    ///
    /// Never in practice; the timestamp is hardcoded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_instant() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

pub use mocks::{FailingIdGenerator, FixedClock, ManualClock, SequentialIdGenerator, test_clock, test_instant};
