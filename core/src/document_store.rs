//! Document store trait: the persistence port every credential store uses.
//!
//! The port is deliberately small. It provides exactly the consistency
//! primitives the stores need from a backing database:
//!
//! - Atomic commits of a write set, validated against a read set
//! - Conditional writes guarded by a document version
//! - Filtered range queries over one collection
//! - Batched deletion
//!
//! # Implementations
//!
//! - `PostgresDocumentStore` (in `idproxy-postgres`): row-versioned JSONB table
//! - `InMemoryDocumentStore` (in `idproxy-testing`): fast, deterministic tests
//!
//! # Transactions
//!
//! [`Transaction`] implements the read-then-conditionally-write protocol on
//! top of [`DocumentStore::commit`]:
//!
//! ```ignore
//! let mut tx = Transaction::new(store);
//! let doc = tx.get(&key).await?;          // version recorded in the read set
//! tx.update(key, body, Precondition::Version(doc.version));
//! tx.commit().await?;                     // Aborted if the document moved
//! ```
//!
//! A commit whose read set no longer matches the stored versions fails with
//! [`DocumentStoreError::Aborted`]; callers re-run the whole transaction.

use crate::document::{Document, DocumentKey, Precondition, Query, Version};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`DocumentStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DocumentStoreError>> + Send + 'a>>;

/// Errors that can occur during document store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentStoreError {
    /// A document read inside the transaction changed before commit.
    ///
    /// This is contention, not a logic error: re-running the transaction
    /// re-reads the document and re-evaluates every guard.
    #[error("Transaction aborted: {key} changed since it was read")]
    Aborted {
        /// The document that moved.
        key: DocumentKey,
    },

    /// A create targeted a key that already holds a document.
    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentKey),

    /// An update or conditional delete targeted a missing document.
    #[error("Document not found: {0}")]
    NotFound(DocumentKey),

    /// A write precondition did not hold at commit time.
    #[error("Precondition failed for {key}: expected {expected:?}, found {actual:?}")]
    FailedPrecondition {
        /// The document the write targeted.
        key: DocumentKey,
        /// The precondition the writer supplied.
        expected: Precondition,
        /// The version actually stored (`None` when absent).
        actual: Option<Version>,
    },

    /// The request was malformed (for example a batch over the backend limit).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The backend is temporarily unreachable.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer before its deadline.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The backend is throttling or out of capacity.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A stored body could not be (de)serialized.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DocumentStoreError {
    /// Returns `true` for failures that may succeed when retried unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use idproxy_core::document::DocumentKey;
    /// use idproxy_core::document_store::DocumentStoreError;
    ///
    /// let key = DocumentKey::new("c", "d");
    /// assert!(DocumentStoreError::Aborted { key: key.clone() }.is_transient());
    /// assert!(!DocumentStoreError::AlreadyExists(key).is_transient());
    /// ```
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Aborted { .. }
                | Self::Unavailable(_)
                | Self::DeadlineExceeded(_)
                | Self::ResourceExhausted(_)
        )
    }

    /// Returns `true` if the commit lost a race on its read set.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// A single write inside a [`Commit`].
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    /// Insert a new document; fails with `AlreadyExists` if the key is taken.
    Create {
        /// Target key.
        key: DocumentKey,
        /// Body.
        data: Value,
    },
    /// Replace the body of an existing document; fails with `NotFound` if absent.
    Update {
        /// Target key.
        key: DocumentKey,
        /// New body.
        data: Value,
        /// Condition checked against the stored version.
        precondition: Precondition,
    },
    /// Remove a document. Deleting a missing document is not an error unless
    /// the precondition demands existence.
    Delete {
        /// Target key.
        key: DocumentKey,
        /// Condition checked against the stored version.
        precondition: Precondition,
    },
}

impl Write {
    /// Key this write targets.
    #[must_use]
    pub const fn key(&self) -> &DocumentKey {
        match self {
            Self::Create { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// An atomic unit of work: the versions observed plus the writes to apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Commit {
    /// Every document read, with the version seen (`None` if it was absent).
    pub reads: Vec<(DocumentKey, Option<Version>)>,
    /// Writes applied all-or-nothing.
    pub writes: Vec<Write>,
}

/// Document store abstraction used by every credential store.
///
/// # Commit Semantics
///
/// [`DocumentStore::commit`] must be atomic. Implementations check, in order:
///
/// 1. Every read-set entry still matches the stored version, else `Aborted`
/// 2. Every `Create` targets an absent key, else `AlreadyExists`
/// 3. Every `Update` targets a present key, else `NotFound`
/// 4. Every precondition holds, else `FailedPrecondition`
///
/// and only then apply all writes. A failed check applies nothing.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; stores share them via
/// `Arc<dyn DocumentStore>` across request workers.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures instead of using `async fn` so the trait can
/// be used as a trait object.
pub trait DocumentStore: Send + Sync {
    /// Read a single document.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / transient variants on backend failure
    fn get<'a>(&'a self, key: &'a DocumentKey) -> StoreFuture<'a, Option<Document>>;

    /// Atomically validate and apply a commit.
    ///
    /// # Errors
    ///
    /// - `Aborted`: a read-set document changed
    /// - `AlreadyExists`, `NotFound`, `FailedPrecondition`: a write check failed
    /// - `DatabaseError` / transient variants on backend failure
    fn commit(&self, commit: Commit) -> StoreFuture<'_, ()>;

    /// Run a filtered query over one collection, ordered by document ID.
    ///
    /// # Errors
    ///
    /// - `DatabaseError` / transient variants on backend failure
    fn query(&self, query: Query) -> StoreFuture<'_, Vec<Document>>;

    /// Delete a batch of documents atomically.
    ///
    /// Returns how many of the keys held a document.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if the batch exceeds [`DocumentStore::max_batch_size`]
    /// - `DatabaseError` / transient variants on backend failure
    fn batch_delete(&self, keys: Vec<DocumentKey>) -> StoreFuture<'_, usize>;

    /// Largest batch accepted by [`DocumentStore::batch_delete`].
    fn max_batch_size(&self) -> usize {
        500
    }

    /// Insert a document if its key is free.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the key is taken
    fn create(&self, key: DocumentKey, data: Value) -> StoreFuture<'_, ()> {
        self.commit(Commit {
            reads: Vec::new(),
            writes: vec![Write::Create { key, data }],
        })
    }
}

/// A single-round-trip optimistic transaction.
///
/// Reads go straight to the store and record the version observed; writes
/// are buffered and sent together, with the read set, on [`Transaction::commit`].
pub struct Transaction<'a> {
    store: &'a dyn DocumentStore,
    commit: Commit,
}

impl<'a> Transaction<'a> {
    /// Begin a transaction against `store`.
    #[must_use]
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            commit: Commit::default(),
        }
    }

    /// Read a document and add it to the read set.
    ///
    /// # Errors
    ///
    /// Propagates backend failures from [`DocumentStore::get`].
    pub async fn get(&mut self, key: &DocumentKey) -> Result<Option<Document>, DocumentStoreError> {
        let document = self.store.get(key).await?;
        self.commit
            .reads
            .push((key.clone(), document.as_ref().map(|doc| doc.version)));
        Ok(document)
    }

    /// Buffer a create.
    pub fn create(&mut self, key: DocumentKey, data: Value) {
        self.commit.writes.push(Write::Create { key, data });
    }

    /// Buffer an update.
    pub fn update(&mut self, key: DocumentKey, data: Value, precondition: Precondition) {
        self.commit.writes.push(Write::Update {
            key,
            data,
            precondition,
        });
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: DocumentKey, precondition: Precondition) {
        self.commit.writes.push(Write::Delete { key, precondition });
    }

    /// Whether any write has been buffered.
    #[must_use]
    pub fn has_writes(&self) -> bool {
        !self.commit.writes.is_empty()
    }

    /// Send the read set and buffered writes as one atomic commit.
    ///
    /// A transaction without writes commits nothing and always succeeds.
    ///
    /// # Errors
    ///
    /// See [`DocumentStore::commit`].
    pub async fn commit(self) -> Result<(), DocumentStoreError> {
        if !self.has_writes() {
            return Ok(());
        }
        self.store.commit(self.commit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_precondition_error_display() {
        let error = DocumentStoreError::FailedPrecondition {
            key: DocumentKey::new("refresh_tokens", "rt-1"),
            expected: Precondition::Version(Version::new(5)),
            actual: Some(Version::new(7)),
        };

        let display = format!("{error}");
        assert!(display.contains("refresh_tokens/rt-1"));
        assert!(display.contains("Version(5)"));
    }

    #[test]
    fn transient_classification() {
        assert!(DocumentStoreError::Unavailable("down".into()).is_transient());
        assert!(DocumentStoreError::DeadlineExceeded("slow".into()).is_transient());
        assert!(DocumentStoreError::ResourceExhausted("quota".into()).is_transient());
        assert!(!DocumentStoreError::DatabaseError("boom".into()).is_transient());
        assert!(!DocumentStoreError::NotFound(DocumentKey::new("c", "d")).is_transient());
    }

    #[test]
    fn write_exposes_its_key() {
        let key = DocumentKey::new("sessions", "s-1");
        let write = Write::Delete {
            key: key.clone(),
            precondition: Precondition::Exists,
        };
        assert_eq!(write.key(), &key);
    }
}
