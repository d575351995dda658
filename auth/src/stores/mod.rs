//! Credential stores.
//!
//! Each store is a stateless façade over a shared [`DocumentStore`]:
//!
//! - **Refresh Token Store** - issue, use, rotate, revoke and purge refresh tokens
//! - **Access Generation Store** - per-user counters that invalidate access tokens
//! - **Session Store** - login sessions with a fixed lifetime
//!
//! Observe-then-write operations run as optimistic transactions; a commit
//! aborted by a concurrent writer is re-run from the read.

pub mod access_generation;
pub mod refresh_token;
pub mod session;

pub use access_generation::AccessGenerationStore;
pub use refresh_token::RefreshTokenStore;
pub use session::{SessionStore, SessionStoreBuilder};

use crate::error::{Result, StoreError};
use idproxy_core::document::Query;
use idproxy_core::document_store::DocumentStore;
use idproxy_runtime::{RetryPolicy, retry_with_predicate};
use std::future::Future;

/// Progress of a best-effort bulk operation.
///
/// Bulk operations are not atomic across their result set: `count` is the
/// number of documents confirmed changed, and `error` is the first failure
/// seen (later ones are logged only).
#[derive(Debug, Clone, PartialEq, Default)]
#[must_use]
pub struct BulkOutcome {
    /// Documents confirmed changed.
    pub count: usize,
    /// First failure, if any.
    pub error: Option<StoreError>,
}

impl BulkOutcome {
    /// Outcome with no failure.
    pub const fn complete(count: usize) -> Self {
        Self { count, error: None }
    }

    /// Whether every item was processed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// The count, or the first error.
    ///
    /// # Errors
    ///
    /// Returns the first recorded error, dropping the partial count.
    pub fn into_result(self) -> Result<usize> {
        match self.error {
            None => Ok(self.count),
            Some(err) => Err(err),
        }
    }

    /// Keep `err` unless an earlier error is already recorded.
    pub(crate) fn record_error(&mut self, err: StoreError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Add another outcome's progress, keeping the first error.
    pub(crate) fn absorb(&mut self, other: Self) {
        self.count += other.count;
        if let Some(err) = other.error {
            self.record_error(err);
        }
    }
}

/// Run a transaction body, re-running it while its commit aborts.
///
/// `body` must build a fresh [`Transaction`](idproxy_core::Transaction) on
/// every call so each attempt re-reads and re-evaluates its guards.
pub(crate) async fn run_transaction<F, Fut, T>(policy: &RetryPolicy, body: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_predicate(policy, body, StoreError::is_aborted).await
}

/// Delete every document matching `query`, `batch_size` at a time.
///
/// Batches already deleted stay deleted when a later batch fails.
pub(crate) async fn delete_matching(
    db: &dyn DocumentStore,
    query: Query,
    batch_size: usize,
) -> BulkOutcome {
    let batch_size = batch_size.clamp(1, db.max_batch_size().max(1));
    let mut outcome = BulkOutcome::default();

    loop {
        let page = match db.query(query.clone().limit(batch_size)).await {
            Ok(page) => page,
            Err(e) => {
                outcome.record_error(e.into());
                return outcome;
            }
        };
        if page.is_empty() {
            return outcome;
        }

        let fetched = page.len();
        let keys = page.into_iter().map(|doc| doc.key).collect();
        match db.batch_delete(keys).await {
            Ok(deleted) => {
                tracing::debug!(collection = %query.collection, deleted, "Deleted batch");
                outcome.count += deleted;
                if deleted == 0 || fetched < batch_size {
                    return outcome;
                }
            }
            Err(e) => {
                tracing::warn!(
                    collection = %query.collection,
                    deleted_so_far = outcome.count,
                    error = %e,
                    "Batch delete failed"
                );
                outcome.record_error(e.into());
                return outcome;
            }
        }
    }
}
