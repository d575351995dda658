//! Store configuration.
//!
//! Each store takes its configuration from the embedding application;
//! `Default` gives production-ready values.

use crate::constants::{DEFAULT_BATCH_SIZE, collections};
use chrono::Duration;
use idproxy_runtime::RetryPolicy;
use std::time::Duration as StdDuration;

/// Retry policy for re-running a transaction whose commit was aborted.
///
/// Short and bounded: an abort means another writer just committed, so the
/// re-run usually succeeds (or observes the winner's state) immediately.
#[must_use]
pub fn default_transaction_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(5)
        .initial_delay(StdDuration::from_millis(5))
        .max_delay(StdDuration::from_millis(100))
        .multiplier(2.0)
        .build()
}

/// Refresh token store configuration.
#[derive(Debug, Clone)]
pub struct RefreshTokenConfig {
    /// Collection holding refresh token records.
    ///
    /// Default: `refresh_tokens`
    pub collection: String,

    /// Documents deleted per batch by `delete_expired`.
    ///
    /// Default: 500
    pub delete_batch_size: usize,

    /// Records read per page by `revoke_family` and `revoke_user`.
    ///
    /// Default: 500
    pub revoke_page_size: usize,

    /// Retry policy for aborted transactions.
    pub transaction_retry: RetryPolicy,
}

impl RefreshTokenConfig {
    /// Set the collection name.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Set the deletion batch size.
    #[must_use]
    pub const fn with_delete_batch_size(mut self, size: usize) -> Self {
        self.delete_batch_size = size;
        self
    }

    /// Set the page size used when revoking a family or a user.
    #[must_use]
    pub const fn with_revoke_page_size(mut self, size: usize) -> Self {
        self.revoke_page_size = size;
        self
    }

    /// Set the transaction retry policy.
    #[must_use]
    pub fn with_transaction_retry(mut self, policy: RetryPolicy) -> Self {
        self.transaction_retry = policy;
        self
    }
}

impl Default for RefreshTokenConfig {
    fn default() -> Self {
        Self {
            collection: collections::REFRESH_TOKENS.to_string(),
            delete_batch_size: DEFAULT_BATCH_SIZE,
            revoke_page_size: DEFAULT_BATCH_SIZE,
            transaction_retry: default_transaction_retry(),
        }
    }
}

/// Access generation store configuration.
#[derive(Debug, Clone)]
pub struct AccessGenerationConfig {
    /// Collection holding one counter per user.
    ///
    /// Default: `access_generations`
    pub collection: String,

    /// Retry policy used by `bump_with_retry`.
    ///
    /// Default: 5 attempts, 50ms initial delay, doubling, 2s cap
    pub bump_retry: RetryPolicy,

    /// Retry policy for aborted transactions inside a single `bump`.
    pub transaction_retry: RetryPolicy,
}

impl AccessGenerationConfig {
    /// Set the collection name.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Set the retry policy used by `bump_with_retry`.
    #[must_use]
    pub fn with_bump_retry(mut self, policy: RetryPolicy) -> Self {
        self.bump_retry = policy;
        self
    }

    /// Set the transaction retry policy.
    #[must_use]
    pub fn with_transaction_retry(mut self, policy: RetryPolicy) -> Self {
        self.transaction_retry = policy;
        self
    }
}

impl Default for AccessGenerationConfig {
    fn default() -> Self {
        Self {
            collection: collections::ACCESS_GENERATIONS.to_string(),
            bump_retry: RetryPolicy::default(),
            transaction_retry: default_transaction_retry(),
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Collection holding sessions.
    ///
    /// Default: `sessions`
    pub collection: String,

    /// Session lifetime from `start`.
    ///
    /// Default: 24 hours
    pub ttl: Duration,

    /// Documents deleted per batch by `purge_expired`.
    ///
    /// Default: 500
    pub purge_batch_size: usize,

    /// Retry policy for aborted transactions.
    pub transaction_retry: RetryPolicy,
}

impl SessionConfig {
    /// Set the collection name.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Set the session lifetime.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the purge batch size.
    #[must_use]
    pub const fn with_purge_batch_size(mut self, size: usize) -> Self {
        self.purge_batch_size = size;
        self
    }

    /// Set the transaction retry policy.
    #[must_use]
    pub fn with_transaction_retry(mut self, policy: RetryPolicy) -> Self {
        self.transaction_retry = policy;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collection: collections::SESSIONS.to_string(),
            ttl: Duration::hours(24),
            purge_batch_size: DEFAULT_BATCH_SIZE,
            transaction_retry: default_transaction_retry(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let refresh = RefreshTokenConfig::default();
        assert_eq!(refresh.collection, "refresh_tokens");
        assert_eq!(refresh.delete_batch_size, 500);
        assert_eq!(refresh.revoke_page_size, 500);

        let generation = AccessGenerationConfig::default();
        assert_eq!(generation.bump_retry.max_attempts, 5);
        assert_eq!(generation.bump_retry.initial_delay, StdDuration::from_millis(50));
        assert_eq!(generation.bump_retry.max_delay, StdDuration::from_secs(2));

        let session = SessionConfig::default();
        assert_eq!(session.ttl, Duration::hours(24));
        assert_eq!(session.purge_batch_size, 500);
    }

    #[test]
    fn test_builder_methods() {
        let config = SessionConfig::default()
            .with_collection("sessions_v2")
            .with_ttl(Duration::minutes(30))
            .with_purge_batch_size(50);

        assert_eq!(config.collection, "sessions_v2");
        assert_eq!(config.ttl, Duration::minutes(30));
        assert_eq!(config.purge_batch_size, 50);
    }
}
