//! In-memory document store for fast, deterministic tests.
//!
//! [`InMemoryDocumentStore`] implements the full commit protocol of
//! [`DocumentStore`] (read-set validation, create/update/delete checks,
//! version preconditions) over a `BTreeMap`, plus a few test hooks:
//!
//! - fault injection for commits and batch deletes
//! - counters for committed transactions and applied writes
//! - raw seeding and inspection that bypass the commit path

use idproxy_core::document::{Document, DocumentKey, Precondition, Query, Version};
use idproxy_core::document_store::{Commit, DocumentStore, DocumentStoreError, StoreFuture, Write};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Inner {
    documents: BTreeMap<DocumentKey, (Value, Version)>,
    revision: u64,
    commit_failures: VecDeque<DocumentStoreError>,
    batch_delete_failures: HashMap<usize, DocumentStoreError>,
    batch_delete_calls: usize,
    commits: usize,
    writes: usize,
    max_batch_size: usize,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            documents: BTreeMap::new(),
            revision: 0,
            commit_failures: VecDeque::new(),
            batch_delete_failures: HashMap::new(),
            batch_delete_calls: 0,
            commits: 0,
            writes: 0,
            max_batch_size: 500,
        }
    }
}

impl Inner {
    /// Next store-wide revision; never hands out the same version twice.
    fn next_version(&mut self) -> Version {
        self.revision += 1;
        Version::new(self.revision)
    }
}

/// In-memory [`DocumentStore`].
///
/// Clones share the same underlying map, so a test can hand one clone to a
/// store and keep another for inspection.
///
/// Every `get` yields to the scheduler before reading, which lets concurrent
/// transactions interleave between their read and their commit the way they
/// would against a remote database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store with the default batch limit (500).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with a custom batch limit.
    #[must_use]
    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        let store = Self::default();
        store.lock().max_batch_size = max_batch_size.max(1);
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next commit fail with `error` (queued, first in first out).
    pub fn fail_next_commit(&self, error: DocumentStoreError) {
        self.lock().commit_failures.push_back(error);
    }

    /// Make the `call`-th batch delete (0-based) fail with `error`.
    pub fn fail_batch_delete_call(&self, call: usize, error: DocumentStoreError) {
        self.lock().batch_delete_failures.insert(call, error);
    }

    /// Store a body directly, bypassing commit checks and counters.
    pub fn insert_raw(&self, key: DocumentKey, data: Value) {
        let mut inner = self.lock();
        let version = inner.next_version();
        inner.documents.insert(key, (data, version));
    }

    /// Read a document directly, without joining any transaction.
    #[must_use]
    pub fn snapshot(&self, key: &DocumentKey) -> Option<Document> {
        self.lock().documents.get(key).map(|(data, version)| Document {
            key: key.clone(),
            data: data.clone(),
            version: *version,
        })
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .documents
            .keys()
            .filter(|key| key.collection() == collection)
            .count()
    }

    /// Number of successful commits so far.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Number of individual writes applied by successful commits so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Number of `batch_delete` calls so far, including failed ones.
    #[must_use]
    pub fn batch_delete_calls(&self) -> usize {
        self.lock().batch_delete_calls
    }
}

fn check_write(
    documents: &BTreeMap<DocumentKey, (Value, Version)>,
    write: &Write,
) -> Result<(), DocumentStoreError> {
    let key = write.key();
    let current = documents.get(key).map(|(_, version)| *version);

    match write {
        Write::Create { .. } => {
            if current.is_some() {
                return Err(DocumentStoreError::AlreadyExists(key.clone()));
            }
        }
        Write::Update { precondition, .. } => {
            if current.is_none() {
                return Err(DocumentStoreError::NotFound(key.clone()));
            }
            if !precondition.holds(current) {
                return Err(DocumentStoreError::FailedPrecondition {
                    key: key.clone(),
                    expected: *precondition,
                    actual: current,
                });
            }
        }
        Write::Delete { precondition, .. } => {
            if *precondition == Precondition::Exists && current.is_none() {
                return Err(DocumentStoreError::NotFound(key.clone()));
            }
            if !precondition.holds(current) {
                return Err(DocumentStoreError::FailedPrecondition {
                    key: key.clone(),
                    expected: *precondition,
                    actual: current,
                });
            }
        }
    }

    Ok(())
}

fn apply_commit(inner: &mut Inner, commit: Commit) -> Result<(), DocumentStoreError> {
    if let Some(error) = inner.commit_failures.pop_front() {
        return Err(error);
    }

    for (key, seen) in &commit.reads {
        let current = inner.documents.get(key).map(|(_, version)| *version);
        if current != *seen {
            return Err(DocumentStoreError::Aborted { key: key.clone() });
        }
    }

    for write in &commit.writes {
        check_write(&inner.documents, write)?;
    }

    let applied = commit.writes.len();
    for write in commit.writes {
        match write {
            Write::Create { key, data } | Write::Update { key, data, .. } => {
                let version = inner.next_version();
                inner.documents.insert(key, (data, version));
            }
            Write::Delete { key, .. } => {
                inner.documents.remove(&key);
            }
        }
    }

    inner.commits += 1;
    inner.writes += applied;
    Ok(())
}

impl DocumentStore for InMemoryDocumentStore {
    fn get<'a>(&'a self, key: &'a DocumentKey) -> StoreFuture<'a, Option<Document>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            Ok(self.snapshot(key))
        })
    }

    fn commit(&self, commit: Commit) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            apply_commit(&mut inner, commit)
        })
    }

    fn query(&self, query: Query) -> StoreFuture<'_, Vec<Document>> {
        Box::pin(async move {
            let inner = self.lock();
            let limit = query.limit.unwrap_or(usize::MAX);
            Ok(inner
                .documents
                .iter()
                .filter(|(key, (data, _))| key.collection() == query.collection && query.matches(data))
                .take(limit)
                .map(|(key, (data, version))| Document {
                    key: key.clone(),
                    data: data.clone(),
                    version: *version,
                })
                .collect())
        })
    }

    fn batch_delete(&self, keys: Vec<DocumentKey>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let mut inner = self.lock();
            let call = inner.batch_delete_calls;
            inner.batch_delete_calls += 1;

            if let Some(error) = inner.batch_delete_failures.remove(&call) {
                return Err(error);
            }

            if keys.len() > inner.max_batch_size {
                return Err(DocumentStoreError::InvalidRequest(format!(
                    "batch of {} exceeds limit of {}",
                    keys.len(),
                    inner.max_batch_size
                )));
            }

            let deleted = keys
                .iter()
                .filter(|key| inner.documents.remove(*key).is_some())
                .count();
            inner.writes += deleted;
            Ok(deleted)
        })
    }

    fn max_batch_size(&self) -> usize {
        self.lock().max_batch_size
    }
}
