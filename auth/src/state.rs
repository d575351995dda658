//! Credential records.
//!
//! Records are plain data; their lifecycle state is derived from timestamps
//! and links by pure predicates, never stored. All persisted timestamps are
//! integer microseconds since the Unix epoch so range queries compare
//! numerically in every backend.

use crate::error::{Result, StoreError};
use chrono::serde::{ts_microseconds, ts_microseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════
// Refresh Tokens
// ═══════════════════════════════════════════════════════════════════════

/// One issued refresh credential.
///
/// Only the keyed digest of the token secret is stored, never the secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshTokenRecord {
    /// Opaque unique ID, also the document key.
    pub refresh_id: String,

    /// Owner.
    pub user_id: String,

    /// Keyed hash of the token secret.
    pub digest: String,

    /// Keyring key that produced `digest`.
    pub key_id: String,

    /// Groups tokens descended from one login via rotation.
    pub family_id: String,

    /// Successor ID once rotated; empty otherwise.
    pub replaced_by: String,

    /// When the token was revoked or rotated away.
    #[serde(with = "ts_microseconds_option")]
    pub revoked_at: Option<DateTime<Utc>>,

    /// Why the token was revoked.
    pub revoke_reason: String,

    /// Issue time; defaulted to the store clock on create.
    #[serde(with = "ts_microseconds_option")]
    pub created_at: Option<DateTime<Utc>>,

    /// Last successful use.
    #[serde(with = "ts_microseconds_option")]
    pub last_used_at: Option<DateTime<Utc>>,

    /// Expiry; `None` never expires.
    #[serde(with = "ts_microseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Retention horizon after which the record is treated as deleted.
    #[serde(with = "ts_microseconds_option")]
    pub delete_at: Option<DateTime<Utc>>,
}

/// Derived lifecycle state of a refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenState {
    /// Usable.
    Active,
    /// Explicitly revoked.
    Revoked,
    /// Rotated away to a successor.
    Replaced,
    /// Past `expires_at`.
    Expired,
}

impl RefreshTokenRecord {
    /// Create a record with the mandatory fields set.
    #[must_use]
    pub fn new(
        refresh_id: impl Into<String>,
        user_id: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            refresh_id: refresh_id.into(),
            user_id: user_id.into(),
            digest: digest.into(),
            ..Self::default()
        }
    }

    /// Set the hashing key ID.
    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    /// Set the family ID.
    #[must_use]
    pub fn with_family_id(mut self, family_id: impl Into<String>) -> Self {
        self.family_id = family_id.into();
        self
    }

    /// Set the issue time.
    #[must_use]
    pub const fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Set the expiry.
    #[must_use]
    pub const fn with_expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Set the retention horizon.
    #[must_use]
    pub const fn with_delete_at(mut self, at: DateTime<Utc>) -> Self {
        self.delete_at = Some(at);
        self
    }

    /// State at `now`, with precedence replaced, revoked, expired, active.
    ///
    /// # Examples
    ///
    /// ```
    /// use idproxy_auth::state::{RefreshTokenRecord, TokenState};
    /// use chrono::{Duration, Utc};
    ///
    /// let now = Utc::now();
    /// let record = RefreshTokenRecord::new("rt-1", "user-1", "digest")
    ///     .with_expires_at(now + Duration::hours(1));
    /// assert_eq!(record.state(now), TokenState::Active);
    /// assert_eq!(record.state(now + Duration::hours(1)), TokenState::Expired);
    /// ```
    #[must_use]
    pub fn state(&self, now: DateTime<Utc>) -> TokenState {
        if !self.replaced_by.is_empty() {
            TokenState::Replaced
        } else if self.revoked_at.is_some() {
            TokenState::Revoked
        } else if self.is_expired(now) {
            TokenState::Expired
        } else {
            TokenState::Active
        }
    }

    /// Whether the token can be used at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == TokenState::Active
    }

    /// Whether `now` is at or past `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Whether `now` is at or past `delete_at`.
    #[must_use]
    pub fn is_past_delete_horizon(&self, now: DateTime<Utc>) -> bool {
        self.delete_at.is_some_and(|delete_at| now >= delete_at)
    }

    /// Check the time ordering of the record's timestamps.
    ///
    /// `last_used_at` and `expires_at` must not precede `created_at`, and
    /// `delete_at` must not precede either of them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] naming the first violated rule.
    pub fn validate_timestamps(&self) -> Result<()> {
        let Some(created_at) = self.created_at else {
            return Ok(());
        };

        if self.last_used_at.is_some_and(|at| at < created_at) {
            return Err(StoreError::InvalidArgument(
                "last_used_at precedes created_at".to_string(),
            ));
        }
        if self.expires_at.is_some_and(|at| at < created_at) {
            return Err(StoreError::InvalidArgument(
                "expires_at precedes created_at".to_string(),
            ));
        }
        if let Some(delete_at) = self.delete_at {
            let floor = self.expires_at.map_or(created_at, |at| at.max(created_at));
            if delete_at < floor {
                return Err(StoreError::InvalidArgument(
                    "delete_at precedes max(expires_at, created_at)".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Access Generations
// ═══════════════════════════════════════════════════════════════════════

/// Per-user counter stamped into access tokens.
///
/// Bumping it invalidates every access token minted under an older
/// generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGenerationRecord {
    /// Owner.
    pub user_id: String,

    /// Current generation, starting at 1.
    #[serde(rename = "gen")]
    pub generation: u64,

    /// Time of the last bump.
    #[serde(with = "ts_microseconds")]
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════

/// Session status. Any stored value other than `"active"` reads back as
/// [`SessionStatus::Inactive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Usable until expiry.
    Active,
    /// Terminal.
    #[serde(other)]
    Inactive,
}

/// One login session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique ID, also the document key.
    pub session_id: String,

    /// Owner.
    pub user_id: String,

    /// Status.
    pub status: SessionStatus,

    /// Start time.
    #[serde(with = "ts_microseconds")]
    pub created_at: DateTime<Utc>,

    /// Expiry.
    #[serde(with = "ts_microseconds")]
    pub expires_at: DateTime<Utc>,

    /// Last modification.
    #[serde(default, with = "ts_microseconds_option")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Last touch.
    #[serde(default, with = "ts_microseconds_option")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the session is active and unexpired at `now`.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.check_usable(now).is_ok()
    }

    /// Check usability at `now`. Expiry is reported before status.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ExpiredSession`] if `now >= expires_at`
    /// - [`StoreError::InactiveSession`] if the status is not active
    pub fn check_usable(&self, now: DateTime<Utc>) -> Result<()> {
        if now >= self.expires_at {
            return Err(StoreError::ExpiredSession);
        }
        if self.status != SessionStatus::Active {
            return Err(StoreError::InactiveSession);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap()
    }

    #[test]
    fn replaced_takes_precedence_over_revoked() {
        let mut record = RefreshTokenRecord::new("rt-1", "user-1", "d");
        record.revoked_at = Some(now());
        assert_eq!(record.state(now()), TokenState::Revoked);

        record.replaced_by = "rt-2".to_string();
        assert_eq!(record.state(now()), TokenState::Replaced);
        assert!(!record.is_active(now()));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let record = RefreshTokenRecord::new("rt-1", "user-1", "d").with_expires_at(now());
        assert!(record.is_active(now() - Duration::microseconds(1)));
        assert_eq!(record.state(now()), TokenState::Expired);
    }

    #[test]
    fn record_without_expiry_stays_active() {
        let record = RefreshTokenRecord::new("rt-1", "user-1", "d");
        assert!(record.is_active(now() + Duration::days(10_000)));
        assert!(!record.is_past_delete_horizon(now()));
    }

    #[test]
    fn timestamp_ordering_is_validated() {
        let record = RefreshTokenRecord::new("rt-1", "user-1", "d")
            .with_created_at(now())
            .with_expires_at(now() + Duration::hours(1))
            .with_delete_at(now() + Duration::minutes(30));
        assert!(record.validate_timestamps().unwrap_err().is_invalid_argument());

        let record = record.with_delete_at(now() + Duration::hours(1));
        assert!(record.validate_timestamps().is_ok());

        let record = RefreshTokenRecord::new("rt-1", "user-1", "d")
            .with_created_at(now())
            .with_expires_at(now() - Duration::seconds(1));
        assert!(record.validate_timestamps().is_err());
    }

    #[test]
    fn timestamps_serialize_as_microseconds() {
        let record = RefreshTokenRecord::new("rt-1", "user-1", "d").with_expires_at(now());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["expires_at"], serde_json::json!(1_735_689_600_000_000_i64));
        assert!(value["revoked_at"].is_null());

        let back: RefreshTokenRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn generation_is_stored_as_gen() {
        let record = AccessGenerationRecord {
            user_id: "user-1".to_string(),
            generation: 3,
            updated_at: now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["gen"], 3);
    }

    #[test]
    fn unknown_session_status_reads_as_inactive() {
        let status: SessionStatus = serde_json::from_value(serde_json::json!("terminated")).unwrap();
        assert_eq!(status, SessionStatus::Inactive);
        let status: SessionStatus = serde_json::from_value(serde_json::json!("active")).unwrap();
        assert_eq!(status, SessionStatus::Active);
    }

    #[test]
    fn expired_is_reported_before_inactive() {
        let session = Session {
            session_id: "s-1".to_string(),
            user_id: "user-1".to_string(),
            status: SessionStatus::Inactive,
            created_at: now() - Duration::hours(2),
            expires_at: now() - Duration::hours(1),
            updated_at: None,
            last_used: None,
        };
        assert_eq!(session.check_usable(now()), Err(StoreError::ExpiredSession));

        let session = Session {
            expires_at: now() + Duration::hours(1),
            ..session
        };
        assert_eq!(session.check_usable(now()), Err(StoreError::InactiveSession));
    }
}
