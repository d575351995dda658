//! # idproxy core
//!
//! Core traits and types shared by the idproxy credential stores.
//!
//! This crate provides the abstractions every store is written against:
//!
//! - **Environment**: injected dependencies (`Clock`, `IdGenerator`)
//! - **Persistence port**: a transactional document store (`DocumentStore`)
//!   with single-document transactions, version preconditions, range
//!   queries and batched deletion
//!
//! ## Architecture Principles
//!
//! - Stores are stateless façades over the persistence port
//! - All cross-writer consistency lives in the backing store's commit
//! - Dependencies are injected, never global
//!
//! ## Example
//!
//! ```ignore
//! use idproxy_core::document::DocumentKey;
//! use idproxy_core::document_store::{DocumentStore, Transaction};
//!
//! async fn touch(store: &dyn DocumentStore) -> Result<(), DocumentStoreError> {
//!     let key = DocumentKey::new("sessions", "s-1");
//!     let mut tx = Transaction::new(store);
//!     if let Some(doc) = tx.get(&key).await? {
//!         tx.update(key, doc.data, Precondition::Version(doc.version));
//!     }
//!     tx.commit().await
//! }
//! ```

pub mod document;
pub mod document_store;

pub use document::{Document, DocumentKey, Filter, FilterOp, Precondition, Query, Version};
pub use document_store::{Commit, DocumentStore, DocumentStoreError, StoreFuture, Transaction, Write};

/// Environment module - Dependency injection traits
///
/// All external dependencies that are not the backing store are abstracted
/// behind these traits and injected into the stores.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use idproxy_core::environment::{Clock, SystemClock};
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

    /// Error returned when an identifier cannot be produced.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("ID generation failed: {0}")]
    pub struct IdGenerationError(pub String);

    /// Source of fresh, unique identifiers.
    pub trait IdGenerator: Send + Sync {
        /// Produce a new identifier.
        ///
        /// # Errors
        ///
        /// Returns [`IdGenerationError`] if the entropy source fails.
        fn next_id(&self) -> Result<String, IdGenerationError>;
    }

    /// Random v4 UUIDs in their hyphenated form.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct UuidGenerator;

    impl IdGenerator for UuidGenerator {
        fn next_id(&self) -> Result<String, IdGenerationError> {
            Ok(uuid::Uuid::new_v4().to_string())
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::environment::{Clock, IdGenerator, SystemClock, UuidGenerator};

    #[test]
    fn uuid_generator_yields_distinct_ids() {
        let ids = UuidGenerator;
        let a = ids.next_id().expect("uuid generation never fails");
        let b = ids.next_id().expect("uuid generation never fails");
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let first = clock.now();
        assert!(clock.now() >= first);
    }
}
