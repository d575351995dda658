//! Session store.
//!
//! Sessions live for a fixed TTL from [`SessionStore::start`]. A session is
//! usable while its status is active and the current time is before
//! `expires_at`; touching it records activity but never extends it.
//!
//! # Example
//!
//! ```ignore
//! let sessions = SessionStore::builder()
//!     .document_store(db)
//!     .clock(Arc::new(SystemClock))
//!     .id_generator(Arc::new(UuidGenerator))
//!     .ttl(Duration::hours(8))
//!     .build()?;
//!
//! let session = sessions.start("user-1").await?;
//! sessions.validate(&session.session_id).await?;
//! ```

use crate::config::SessionConfig;
use crate::error::{Result, StoreError};
use crate::state::{Session, SessionStatus};
use crate::stores::{BulkOutcome, delete_matching, run_transaction};
use crate::utils::{micros, validate_id};
use chrono::Duration;
use idproxy_core::document::{DocumentKey, Filter, Precondition, Query};
use idproxy_core::document_store::{DocumentStore, Transaction};
use idproxy_core::environment::{Clock, IdGenerator};
use std::sync::Arc;

/// Transactional store for [`Session`]s.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: SessionConfig,
}

/// Builder for [`SessionStore`].
///
/// The document store, clock and ID generator are required.
#[derive(Default)]
pub struct SessionStoreBuilder {
    db: Option<Arc<dyn DocumentStore>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: SessionConfig,
}

impl SessionStoreBuilder {
    /// Set the backing document store.
    #[must_use]
    pub fn document_store(mut self, db: Arc<dyn DocumentStore>) -> Self {
        self.db = Some(db);
        self
    }

    /// Set the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the session ID generator.
    #[must_use]
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the session lifetime.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Build the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] naming the first missing dependency.
    pub fn build(self) -> Result<SessionStore> {
        let db = self
            .db
            .ok_or_else(|| StoreError::InvalidConfig("session store requires a document store".to_string()))?;
        let clock = self
            .clock
            .ok_or_else(|| StoreError::InvalidConfig("session store requires a clock".to_string()))?;
        let ids = self
            .ids
            .ok_or_else(|| StoreError::InvalidConfig("session store requires an ID generator".to_string()))?;

        Ok(SessionStore {
            db,
            clock,
            ids,
            config: self.config,
        })
    }
}

impl SessionStore {
    /// Start building a store.
    #[must_use]
    pub fn builder() -> SessionStoreBuilder {
        SessionStoreBuilder::default()
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.config.ttl <= Duration::zero() {
            return Err(StoreError::InvalidConfig(format!(
                "session ttl must be positive, got {}",
                self.config.ttl
            )));
        }
        Ok(())
    }

    fn key(&self, session_id: &str) -> Result<DocumentKey> {
        validate_id(session_id)?;
        Ok(DocumentKey::new(self.config.collection.as_str(), session_id))
    }

    /// Start a session for `user_id`, expiring `ttl` from now.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidConfig`] for a non-positive TTL, or one too
    ///   large to add to the current time
    /// - [`StoreError::EmptyUserId`] for an empty user ID
    /// - [`StoreError::IdGeneration`] if no session ID could be generated
    /// - [`StoreError::Conflict`] if the generated ID is already taken
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, user_id: &str) -> Result<Session> {
        self.ensure_configured()?;
        if user_id.is_empty() {
            return Err(StoreError::EmptyUserId);
        }

        let session_id = self
            .ids
            .next_id()
            .map_err(|e| StoreError::IdGeneration(e.to_string()))?;
        let key = self.key(&session_id)?;
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(self.config.ttl).ok_or_else(|| {
            StoreError::InvalidConfig(format!("session ttl {} overflows expires_at", self.config.ttl))
        })?;
        let session = Session {
            session_id,
            user_id: user_id.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            expires_at,
            updated_at: None,
            last_used: None,
        };

        self.db.create(key, serde_json::to_value(&session)?).await?;

        tracing::info!(session_id = %session.session_id, "Session started");
        metrics::counter!("session.started").increment(1);
        Ok(session)
    }

    /// Raw lookup, whatever the session's state.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidId`] for a malformed ID
    /// - [`StoreError::NotFound`] if no such session exists
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.ensure_configured()?;
        let key = self.key(session_id)?;
        let doc = self
            .db
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(doc.decode()?)
    }

    /// Look up a session and check that it is usable now.
    ///
    /// # Errors
    ///
    /// - everything [`SessionStore::get`] returns
    /// - [`StoreError::ExpiredSession`] if it has expired
    /// - [`StoreError::InactiveSession`] if it is no longer active
    #[tracing::instrument(skip(self))]
    pub async fn validate(&self, session_id: &str) -> Result<Session> {
        let session = self.get(session_id).await?;
        session.check_usable(self.clock.now())?;
        Ok(session)
    }

    /// Record activity on a usable session. `expires_at` is unchanged.
    ///
    /// # Errors
    ///
    /// Same as [`SessionStore::validate`]; rejections write nothing.
    #[tracing::instrument(skip(self))]
    pub async fn touch(&self, session_id: &str) -> Result<Session> {
        self.ensure_configured()?;
        let key = &self.key(session_id)?;

        run_transaction(&self.config.transaction_retry, move || async move {
            let mut tx = Transaction::new(self.db.as_ref());
            let doc = tx
                .get(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let mut session: Session = doc.decode()?;
            let now = self.clock.now();
            session.check_usable(now)?;

            session.last_used = Some(now);
            session.updated_at = Some(now);
            tx.update(
                key.clone(),
                serde_json::to_value(&session)?,
                Precondition::Version(doc.version),
            );
            tx.commit().await?;
            Ok(session)
        })
        .await
    }

    /// End a usable session.
    ///
    /// Invalidating a session that is already expired or inactive is an
    /// error, not a no-op.
    ///
    /// # Errors
    ///
    /// Same as [`SessionStore::validate`]; rejections write nothing.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, session_id: &str) -> Result<Session> {
        self.ensure_configured()?;
        let key = &self.key(session_id)?;

        let session = run_transaction(&self.config.transaction_retry, move || async move {
            let mut tx = Transaction::new(self.db.as_ref());
            let doc = tx
                .get(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let mut session: Session = doc.decode()?;
            let now = self.clock.now();
            session.check_usable(now)?;

            session.status = SessionStatus::Inactive;
            session.updated_at = Some(now);
            tx.update(
                key.clone(),
                serde_json::to_value(&session)?,
                Precondition::Version(doc.version),
            );
            tx.commit().await?;
            Ok(session)
        })
        .await?;

        tracing::info!("Session invalidated");
        metrics::counter!("session.invalidated").increment(1);
        Ok(session)
    }

    /// Delete every session that expired before now.
    #[tracing::instrument(skip(self))]
    pub async fn purge_expired(&self) -> BulkOutcome {
        if let Err(e) = self.ensure_configured() {
            return BulkOutcome {
                count: 0,
                error: Some(e),
            };
        }

        let query = Query::collection(self.config.collection.as_str())
            .filter(Filter::lt("expires_at", micros(self.clock.now())));
        let outcome = delete_matching(self.db.as_ref(), query, self.config.purge_batch_size).await;

        tracing::info!(count = outcome.count, complete = outcome.is_complete(), "Expired sessions purged");
        metrics::counter!("session.purged").increment(u64::try_from(outcome.count).unwrap_or(u64::MAX));
        outcome
    }
}
