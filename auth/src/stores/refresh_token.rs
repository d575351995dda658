//! Refresh token store.
//!
//! Refresh tokens are long-lived credentials exchanged for access tokens.
//! Every use rotates the token: the presented record is linked to its
//! successor and revoked in the same commit that creates the successor, so
//! exactly one rotation of a given token can ever succeed.
//!
//! # Lifecycle
//!
//! ```text
//! create ──► active ──mark_used──► active
//!              │
//!              ├──replace──► replaced (successor created, same family)
//!              ├──revoke / revoke_family / revoke_user──► revoked
//!              └──time passes──► expired
//!
//! delete_expired removes expired and revoked records.
//! ```
//!
//! Presenting a replaced or revoked token again is a theft signal. Callers
//! typically answer it with [`RefreshTokenStore::revoke_family`] plus a bump
//! of the user's access generation.

use crate::config::RefreshTokenConfig;
use crate::error::{Result, StoreError};
use crate::state::RefreshTokenRecord;
use crate::stores::{BulkOutcome, delete_matching, run_transaction};
use crate::utils::{is_zero_instant, micros, validate_id};
use chrono::{DateTime, Utc};
use idproxy_core::document::{DocumentKey, Filter, Precondition, Query};
use idproxy_core::document_store::{DocumentStore, Transaction};
use idproxy_core::environment::Clock;
use std::sync::Arc;

/// Transactional store for [`RefreshTokenRecord`]s.
///
/// Cheap to clone; clones share the backing store and clock.
#[derive(Clone)]
pub struct RefreshTokenStore {
    db: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: RefreshTokenConfig,
}

impl RefreshTokenStore {
    /// Create a store with the default configuration.
    #[must_use]
    pub fn new(db: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(db, clock, RefreshTokenConfig::default())
    }

    /// Create a store with a custom configuration.
    #[must_use]
    pub fn with_config(
        db: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: RefreshTokenConfig,
    ) -> Self {
        Self { db, clock, config }
    }

    /// Store configuration.
    #[must_use]
    pub const fn config(&self) -> &RefreshTokenConfig {
        &self.config
    }

    fn key(&self, refresh_id: &str) -> DocumentKey {
        DocumentKey::new(self.config.collection.as_str(), refresh_id)
    }

    /// Persist a newly issued token.
    ///
    /// `created_at` defaults to now and `family_id` to the token's own ID
    /// (the root of a new family).
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidId`] / [`StoreError::InvalidArgument`] for a
    ///   malformed record, before any I/O
    /// - [`StoreError::Conflict`] if the ID is already taken
    #[tracing::instrument(skip(self, record), fields(refresh_id = %record.refresh_id, user_id = %record.user_id))]
    pub async fn create(&self, mut record: RefreshTokenRecord) -> Result<RefreshTokenRecord> {
        validate_id(&record.refresh_id)?;
        validate_issuable(&record)?;

        if record.created_at.is_none() {
            record.created_at = Some(self.clock.now());
        }
        record.validate_timestamps()?;
        if record.family_id.is_empty() {
            record.family_id.clone_from(&record.refresh_id);
        }

        let body = serde_json::to_value(&record)?;
        self.db.create(self.key(&record.refresh_id), body).await?;

        tracing::info!(family_id = %record.family_id, "Refresh token created");
        metrics::counter!("refresh_token.created").increment(1);
        Ok(record)
    }

    /// Look up a token by ID.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidId`] for a malformed ID
    /// - [`StoreError::NotFound`] if no such token exists
    #[tracing::instrument(skip(self))]
    pub async fn get_by_id(&self, refresh_id: &str) -> Result<RefreshTokenRecord> {
        validate_id(refresh_id)?;
        let key = self.key(refresh_id);
        let doc = self
            .db
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        tracing::debug!("Refresh token loaded");
        Ok(doc.decode()?)
    }

    /// Record a use of the token at the current time.
    ///
    /// Only `last_used_at` changes. Rejections write nothing.
    ///
    /// # Errors
    ///
    /// Checked in this order:
    ///
    /// - [`StoreError::NotFound`] if the token does not exist
    /// - [`StoreError::Revoked`] if it was revoked or rotated away
    /// - [`StoreError::Deleted`] if it is past its retention horizon
    /// - [`StoreError::Expired`] if it is past its expiry
    #[tracing::instrument(skip(self))]
    pub async fn mark_used(&self, refresh_id: &str) -> Result<RefreshTokenRecord> {
        validate_id(refresh_id)?;
        let key = &self.key(refresh_id);

        run_transaction(&self.config.transaction_retry, move || async move {
            let mut tx = Transaction::new(self.db.as_ref());
            let doc = tx
                .get(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let mut record: RefreshTokenRecord = doc.decode()?;
            let now = self.clock.now();

            if record.revoked_at.is_some() {
                tracing::warn!(
                    family_id = %record.family_id,
                    replaced_by = %record.replaced_by,
                    "Revoked refresh token presented"
                );
                return Err(StoreError::Revoked);
            }
            if record.is_past_delete_horizon(now) {
                return Err(StoreError::Deleted);
            }
            if record.is_expired(now) {
                return Err(StoreError::Expired);
            }

            record.last_used_at = Some(now);
            tx.update(
                key.clone(),
                serde_json::to_value(&record)?,
                Precondition::Version(doc.version),
            );
            tx.commit().await?;
            Ok(record)
        })
        .await
    }

    /// Rotate `old_id` to `new_record` at time `at`.
    ///
    /// The successor inherits the old token's family and is stamped
    /// `created_at = at`; the old token gets `replaced_by` and `revoked_at`.
    /// Both writes land or neither does.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidId`] / [`StoreError::InvalidArgument`] for
    ///   malformed input (including identical IDs), before any I/O
    /// - [`StoreError::NotFound`] if the old token does not exist
    /// - [`StoreError::Conflict`] if the old token is not active at `at`,
    ///   belongs to another user, or the new ID is taken
    #[tracing::instrument(skip(self, new_record), fields(new_id = %new_record.refresh_id))]
    pub async fn replace(
        &self,
        old_id: &str,
        new_record: RefreshTokenRecord,
        at: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord> {
        validate_id(old_id)?;
        validate_id(&new_record.refresh_id)?;
        if old_id == new_record.refresh_id {
            return Err(StoreError::InvalidArgument(
                "replacement must have a new refresh_id".to_string(),
            ));
        }
        validate_issuable(&new_record)?;

        let mut new_record = new_record;
        new_record.created_at = Some(at);
        new_record.validate_timestamps()?;

        let old_key = &self.key(old_id);
        let new_key = &self.key(&new_record.refresh_id);
        let new_record = &new_record;

        let successor = run_transaction(&self.config.transaction_retry, move || async move {
            let mut tx = Transaction::new(self.db.as_ref());
            let old_doc = tx
                .get(old_key)
                .await?
                .ok_or_else(|| StoreError::NotFound(old_key.to_string()))?;
            let mut old: RefreshTokenRecord = old_doc.decode()?;

            if !old.is_active(at) {
                tracing::warn!(
                    family_id = %old.family_id,
                    state = ?old.state(at),
                    "Rotation of inactive refresh token rejected"
                );
                return Err(StoreError::Conflict(format!(
                    "refresh token {old_id} is not active"
                )));
            }
            if old.user_id != new_record.user_id {
                tracing::warn!("Rotation across users rejected");
                return Err(StoreError::Conflict(format!(
                    "refresh token {old_id} belongs to another user"
                )));
            }

            let mut successor = new_record.clone();
            successor.family_id = if old.family_id.is_empty() {
                old.refresh_id.clone()
            } else {
                old.family_id.clone()
            };

            if tx.get(new_key).await?.is_some() {
                return Err(StoreError::Conflict(format!("{new_key} already exists")));
            }

            old.replaced_by.clone_from(&successor.refresh_id);
            old.revoked_at = Some(at);
            tx.update(
                old_key.clone(),
                serde_json::to_value(&old)?,
                Precondition::Version(old_doc.version),
            );
            tx.create(new_key.clone(), serde_json::to_value(&successor)?);
            tx.commit().await?;
            Ok(successor)
        })
        .await?;

        tracing::info!(family_id = %successor.family_id, "Refresh token rotated");
        metrics::counter!("refresh_token.rotated").increment(1);
        Ok(successor)
    }

    /// Revoke one token at time `at`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidId`] for a malformed ID
    /// - [`StoreError::NotFound`] if the token does not exist
    /// - [`StoreError::AlreadyRevoked`] if it is not active at `at`
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, refresh_id: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        validate_id(refresh_id)?;
        let key = &self.key(refresh_id);

        run_transaction(&self.config.transaction_retry, move || async move {
            let mut tx = Transaction::new(self.db.as_ref());
            let doc = tx
                .get(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let mut record: RefreshTokenRecord = doc.decode()?;

            if !record.is_active(at) {
                return Err(StoreError::AlreadyRevoked);
            }

            record.revoked_at = Some(at);
            record.revoke_reason = reason.to_string();
            tx.update(
                key.clone(),
                serde_json::to_value(&record)?,
                Precondition::Version(doc.version),
            );
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::info!(reason, "Refresh token revoked");
        metrics::counter!("refresh_token.revoked", "scope" => "token").increment(1);
        Ok(())
    }

    /// Revoke every not-yet-revoked token of a family.
    ///
    /// Best effort: tokens are read a page at a time, each one is revoked by
    /// its own conditional write, and the walk continues past failures. A
    /// missing `at` means now.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_family(
        &self,
        family_id: &str,
        reason: &str,
        at: Option<DateTime<Utc>>,
    ) -> BulkOutcome {
        if family_id.is_empty() {
            return BulkOutcome {
                count: 0,
                error: Some(StoreError::InvalidArgument("family_id is empty".to_string())),
            };
        }
        let query = Query::collection(self.config.collection.as_str())
            .filter(Filter::eq("family_id", family_id));
        let outcome = self.revoke_matching(query, reason, at).await;

        tracing::info!(count = outcome.count, complete = outcome.is_complete(), "Refresh token family revoked");
        metrics::counter!("refresh_token.revoked", "scope" => "family").increment(u64::try_from(outcome.count).unwrap_or(u64::MAX));
        outcome
    }

    /// Revoke every not-yet-revoked token of a user, across all families.
    ///
    /// Same best-effort semantics as [`RefreshTokenStore::revoke_family`].
    #[tracing::instrument(skip(self))]
    pub async fn revoke_user(
        &self,
        user_id: &str,
        reason: &str,
        at: Option<DateTime<Utc>>,
    ) -> BulkOutcome {
        if user_id.is_empty() {
            return BulkOutcome {
                count: 0,
                error: Some(StoreError::InvalidArgument("user_id is empty".to_string())),
            };
        }
        let query = Query::collection(self.config.collection.as_str())
            .filter(Filter::eq("user_id", user_id));
        let outcome = self.revoke_matching(query, reason, at).await;

        tracing::info!(count = outcome.count, complete = outcome.is_complete(), "User refresh tokens revoked");
        metrics::counter!("refresh_token.revoked", "scope" => "user").increment(u64::try_from(outcome.count).unwrap_or(u64::MAX));
        outcome
    }

    /// Revoke the records matching `query`, reading them in pages of
    /// `revoke_page_size` keyed on `refresh_id`.
    async fn revoke_matching(
        &self,
        query: Query,
        reason: &str,
        at: Option<DateTime<Utc>>,
    ) -> BulkOutcome {
        let at = at.unwrap_or_else(|| self.clock.now());
        let page_size = self.config.revoke_page_size.max(1);
        let mut outcome = BulkOutcome::default();
        let mut after: Option<String> = None;

        loop {
            let mut page = query.clone().limit(page_size);
            if let Some(last) = &after {
                page = page.filter(Filter::gt("refresh_id", last.as_str()));
            }

            let docs = match self.db.query(page).await {
                Ok(docs) => docs,
                Err(e) => {
                    outcome.record_error(e.into());
                    return outcome;
                }
            };
            let full_page = docs.len() == page_size;
            after = docs.last().map(|doc| doc.key.id().to_string());

            for doc in docs {
                match self.revoke_if_unrevoked(&doc.key, reason, at).await {
                    Ok(true) => outcome.count += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(key = %doc.key, error = %e, "Failed to revoke refresh token");
                        outcome.record_error(e);
                    }
                }
            }

            if !full_page {
                return outcome;
            }
        }
    }

    async fn revoke_if_unrevoked(
        &self,
        key: &DocumentKey,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        run_transaction(&self.config.transaction_retry, move || async move {
            let mut tx = Transaction::new(self.db.as_ref());
            let Some(doc) = tx.get(key).await? else {
                return Ok(false);
            };
            let mut record: RefreshTokenRecord = doc.decode()?;
            if record.revoked_at.is_some() {
                return Ok(false);
            }

            record.revoked_at = Some(at);
            record.revoke_reason = reason.to_string();
            tx.update(
                key.clone(),
                serde_json::to_value(&record)?,
                Precondition::Version(doc.version),
            );
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    /// Every token of `user_id` that is active now, ordered by ID.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidArgument`] for an empty user ID
    /// - [`StoreError::Backend`] on query failure
    #[tracing::instrument(skip(self))]
    pub async fn list_active_for_user(&self, user_id: &str) -> Result<Vec<RefreshTokenRecord>> {
        if user_id.is_empty() {
            return Err(StoreError::InvalidArgument("user_id is empty".to_string()));
        }
        let now = self.clock.now();
        let query = Query::collection(self.config.collection.as_str())
            .filter(Filter::eq("user_id", user_id));

        let mut active = Vec::new();
        for doc in self.db.query(query).await? {
            let record: RefreshTokenRecord = doc.decode()?;
            if record.is_active(now) {
                active.push(record);
            }
        }
        tracing::debug!(count = active.len(), "Listed active refresh tokens");
        Ok(active)
    }

    /// Delete every token expired or revoked at or before `until`.
    ///
    /// Runs in batches of `delete_batch_size`. Batches already deleted stay
    /// deleted if a later one fails; the outcome carries both the count and
    /// the error.
    #[tracing::instrument(skip(self))]
    pub async fn delete_expired(&self, until: DateTime<Utc>) -> BulkOutcome {
        if is_zero_instant(until) {
            return BulkOutcome {
                count: 0,
                error: Some(StoreError::InvalidArgument(
                    "delete_expired requires a non-zero cutoff".to_string(),
                )),
            };
        }

        let collection = self.config.collection.as_str();
        let batch_size = self.config.delete_batch_size;
        let cutoff = micros(until);

        let mut outcome = delete_matching(
            self.db.as_ref(),
            Query::collection(collection).filter(Filter::lte("expires_at", cutoff)),
            batch_size,
        )
        .await;

        if outcome.is_complete() {
            outcome.absorb(
                delete_matching(
                    self.db.as_ref(),
                    Query::collection(collection)
                        .filter(Filter::gt("revoked_at", 0))
                        .filter(Filter::lte("revoked_at", cutoff)),
                    batch_size,
                )
                .await,
            );
        }

        if let Some(e) = &outcome.error {
            tracing::warn!(count = outcome.count, error = %e, "Refresh token purge stopped early");
        } else {
            tracing::info!(count = outcome.count, "Expired refresh tokens deleted");
        }
        metrics::counter!("refresh_token.purged").increment(u64::try_from(outcome.count).unwrap_or(u64::MAX));
        outcome
    }
}

/// Checks shared by `create` and `replace` for a record about to be issued.
fn validate_issuable(record: &RefreshTokenRecord) -> Result<()> {
    if record.user_id.is_empty() {
        return Err(StoreError::InvalidArgument("user_id is empty".to_string()));
    }
    if record.digest.is_empty() {
        return Err(StoreError::InvalidArgument("digest is empty".to_string()));
    }
    if !record.replaced_by.is_empty() {
        return Err(StoreError::InvalidArgument(
            "new token cannot already be replaced".to_string(),
        ));
    }
    if record.revoked_at.is_some() {
        return Err(StoreError::InvalidArgument(
            "new token cannot already be revoked".to_string(),
        ));
    }
    Ok(())
}
