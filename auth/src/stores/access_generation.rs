//! Access generation store.
//!
//! Each user has a monotonically increasing counter. Access tokens carry the
//! generation they were minted under; verifiers reject tokens whose
//! generation is older than [`AccessGenerationStore::current`]. Bumping the
//! counter therefore invalidates every outstanding access token of the user
//! at once, without tracking the tokens themselves.
//!
//! Concurrent bumps for one user serialize through abort-and-retry: no
//! increment is ever lost, and `n` successful bumps starting from nothing
//! leave the counter at exactly `n`.

use crate::config::AccessGenerationConfig;
use crate::error::{Result, StoreError};
use crate::state::AccessGenerationRecord;
use crate::stores::run_transaction;
use crate::utils::validate_id;
use chrono::{DateTime, Utc};
use idproxy_core::document::{DocumentKey, Precondition};
use idproxy_core::document_store::{DocumentStore, Transaction};
use idproxy_core::environment::Clock;
use idproxy_runtime::retry_until_cancelled;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-user access generation counters.
#[derive(Clone)]
pub struct AccessGenerationStore {
    db: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: AccessGenerationConfig,
}

impl AccessGenerationStore {
    /// Create a store with the default configuration.
    #[must_use]
    pub fn new(db: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(db, clock, AccessGenerationConfig::default())
    }

    /// Create a store with a custom configuration.
    #[must_use]
    pub fn with_config(
        db: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: AccessGenerationConfig,
    ) -> Self {
        Self { db, clock, config }
    }

    fn key(&self, user_id: &str) -> Result<DocumentKey> {
        validate_id(user_id)
            .map_err(|_| StoreError::InvalidArgument(format!("invalid user_id {user_id:?}")))?;
        Ok(DocumentKey::new(self.config.collection.as_str(), user_id))
    }

    /// Increment the user's generation and return the new value.
    ///
    /// The first bump creates the counter at 1. A missing `at` means now.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidArgument`] for an unusable user ID
    /// - [`StoreError::Backend`] if the commit keeps aborting or the backend fails
    #[tracing::instrument(skip(self))]
    pub async fn bump(&self, user_id: &str, at: Option<DateTime<Utc>>) -> Result<u64> {
        let key = self.key(user_id)?;
        let at = at.unwrap_or_else(|| self.clock.now());
        self.bump_at(&key, user_id, at).await
    }

    /// [`AccessGenerationStore::bump`] under the configured retry policy.
    ///
    /// Transient failures (including aborts left over after the transaction
    /// runner gave up) are retried with backoff. `at` is resolved once, so
    /// every attempt stamps the same time.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Cancelled`] as soon as `cancel` fires
    /// - [`StoreError::InvalidArgument`] for an unusable user ID
    /// - the last transient error once the retry budget is spent
    #[tracing::instrument(skip(self, cancel))]
    pub async fn bump_with_retry(
        &self,
        user_id: &str,
        at: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let key = &self.key(user_id)?;
        let at = at.unwrap_or_else(|| self.clock.now());

        retry_until_cancelled(
            &self.config.bump_retry,
            cancel,
            move || self.bump_at(key, user_id, at),
            StoreError::is_transient,
        )
        .await
    }

    async fn bump_at(&self, key: &DocumentKey, user_id: &str, at: DateTime<Utc>) -> Result<u64> {
        let generation = run_transaction(&self.config.transaction_retry, move || async move {
            let mut tx = Transaction::new(self.db.as_ref());
            let record = match tx.get(key).await? {
                None => {
                    let record = AccessGenerationRecord {
                        user_id: user_id.to_string(),
                        generation: 1,
                        updated_at: at,
                    };
                    tx.create(key.clone(), serde_json::to_value(&record)?);
                    record
                }
                Some(doc) => {
                    let mut record: AccessGenerationRecord = doc.decode()?;
                    record.generation += 1;
                    record.updated_at = at;
                    tx.update(
                        key.clone(),
                        serde_json::to_value(&record)?,
                        Precondition::Version(doc.version),
                    );
                    record
                }
            };
            tx.commit().await?;
            Ok(record.generation)
        })
        .await?;

        tracing::info!(user_id, generation, "Access generation bumped");
        metrics::counter!("access_generation.bumped").increment(1);
        Ok(generation)
    }

    /// Current generation of the user; 0 if it was never bumped.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidArgument`] for an unusable user ID
    /// - [`StoreError::Backend`] on backend failure
    #[tracing::instrument(skip(self))]
    pub async fn current(&self, user_id: &str) -> Result<u64> {
        let key = self.key(user_id)?;
        match self.db.get(&key).await? {
            None => Ok(0),
            Some(doc) => {
                let record: AccessGenerationRecord = doc.decode()?;
                Ok(record.generation)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use idproxy_core::document_store::DocumentStoreError;
    use idproxy_runtime::RetryPolicy;
    use idproxy_testing::{InMemoryDocumentStore, test_clock, test_instant};
    use std::time::Duration;

    fn setup() -> (AccessGenerationStore, InMemoryDocumentStore) {
        let db = InMemoryDocumentStore::new();
        let config = AccessGenerationConfig::default().with_bump_retry(
            RetryPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5))
                .build(),
        );
        let store = AccessGenerationStore::with_config(Arc::new(db.clone()), Arc::new(test_clock()), config);
        (store, db)
    }

    #[tokio::test]
    async fn first_bump_creates_then_increments() {
        let (store, db) = setup();
        assert_eq!(store.current("user-1").await.unwrap(), 0);

        assert_eq!(store.bump("user-1", None).await.unwrap(), 1);
        assert_eq!(store.bump("user-1", None).await.unwrap(), 2);
        assert_eq!(store.current("user-1").await.unwrap(), 2);
        assert_eq!(store.current("user-2").await.unwrap(), 0);

        let doc = db.snapshot(&DocumentKey::new("access_generations", "user-1")).unwrap();
        let record: AccessGenerationRecord = doc.decode().unwrap();
        assert_eq!(record.updated_at, test_instant());
    }

    #[tokio::test]
    async fn bump_rejects_bad_user_id() {
        let (store, db) = setup();
        assert!(store.bump("", None).await.unwrap_err().is_invalid_argument());
        assert!(store.bump("a/b", None).await.unwrap_err().is_invalid_argument());
        assert_eq!(db.commit_count(), 0);
    }

    #[tokio::test]
    async fn bump_with_retry_survives_transient_failures() {
        let (store, db) = setup();
        let cancel = CancellationToken::new();
        db.fail_next_commit(DocumentStoreError::Unavailable("failover".into()));
        db.fail_next_commit(DocumentStoreError::DeadlineExceeded("slow".into()));

        assert_eq!(store.bump_with_retry("user-1", None, &cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bump_with_retry_gives_up_with_last_error() {
        let (store, db) = setup();
        for _ in 0..3 {
            db.fail_next_commit(DocumentStoreError::Unavailable("down".into()));
        }

        let err = store
            .bump_with_retry("user-1", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.current("user-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bump_with_retry_stops_on_permanent_error() {
        let (store, db) = setup();
        db.fail_next_commit(DocumentStoreError::DatabaseError("corrupt".into()));
        db.fail_next_commit(DocumentStoreError::Unavailable("unused".into()));

        let err = store
            .bump_with_retry("user-1", None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Backend(DocumentStoreError::DatabaseError("corrupt".into())));
    }

    #[tokio::test]
    async fn cancelled_bump_writes_nothing() {
        let (store, db) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.bump_with_retry("user-1", None, &cancel).await.unwrap_err();

        assert_eq!(err, StoreError::Cancelled);
        assert_eq!(db.commit_count(), 0);
    }
}
