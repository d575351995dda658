//! Error types for credential lifecycle operations.

use idproxy_core::document_store::DocumentStoreError;
use idproxy_runtime::retry::Cancelled;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error taxonomy for the credential stores.
///
/// Variants describe the *kind* of failure. Backend errors are classified
/// once, at the store boundary: creation collisions and failed version
/// preconditions become [`StoreError::Conflict`], transient backend signals
/// stay wrapped in [`StoreError::Backend`] so retry predicates can see them.
///
/// Only `InvalidArgument`-class messages are meant to reach end users; the
/// HTTP layer maps every other kind to a generic response.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    // ═══════════════════════════════════════════════════════════
    // Input Validation (never retried)
    // ═══════════════════════════════════════════════════════════

    /// Malformed input caught before any I/O.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Document ID is empty, contains a path separator, or is otherwise unusable.
    #[error("Invalid ID: {0:?}")]
    InvalidId(String),

    /// Session requested for an empty user ID.
    #[error("User ID is empty")]
    EmptyUserId,

    /// Store wired with missing or unusable dependencies.
    #[error("Store misconfigured: {0}")]
    InvalidConfig(String),

    // ═══════════════════════════════════════════════════════════
    // Lookup & State Machine
    // ═══════════════════════════════════════════════════════════

    /// Key absent in the backing store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Creation collision, rejected transition, or lost optimistic-concurrency race.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Revocation requested for a token that is no longer active.
    #[error("Refresh token already revoked or inactive")]
    AlreadyRevoked,

    // ═══════════════════════════════════════════════════════════
    // Refresh Token Use (checked in this order)
    // ═══════════════════════════════════════════════════════════

    /// Token was revoked (or rotated away).
    #[error("Refresh token has been revoked")]
    Revoked,

    /// Token is past its retention horizon.
    #[error("Refresh token is past its deletion horizon")]
    Deleted,

    /// Token is past its expiry.
    #[error("Refresh token has expired")]
    Expired,

    // ═══════════════════════════════════════════════════════════
    // Session Errors
    // ═══════════════════════════════════════════════════════════

    /// Session is past `expires_at`.
    #[error("Session has expired")]
    ExpiredSession,

    /// Session status is not active.
    #[error("Session is not active")]
    InactiveSession,

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The ID generator failed.
    #[error("ID generation failed: {0}")]
    IdGeneration(String),

    /// A stored record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend failure, cause preserved for diagnostics.
    #[error("Backend error: {0}")]
    Backend(#[source] DocumentStoreError),
}

impl StoreError {
    /// Returns `true` for malformed-input errors caught before I/O.
    ///
    /// # Examples
    ///
    /// ```
    /// # use idproxy_auth::StoreError;
    /// assert!(StoreError::InvalidId("a/b".into()).is_invalid_argument());
    /// assert!(!StoreError::Revoked.is_invalid_argument());
    /// ```
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::InvalidId(_) | Self::EmptyUserId
        )
    }

    /// Returns `true` for transient backend failures worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if a transaction lost a race on its read set.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_aborted(),
            _ => false,
        }
    }

    /// Returns `true` if this error hints at stolen or replayed credentials.
    ///
    /// A revoked or already-rotated refresh token being presented again is
    /// the classic theft signal; callers usually answer it by revoking the
    /// whole family and bumping the user's access generation.
    ///
    /// # Examples
    ///
    /// ```
    /// # use idproxy_auth::StoreError;
    /// assert!(StoreError::Revoked.is_security_signal());
    /// assert!(!StoreError::Expired.is_security_signal());
    /// ```
    #[must_use]
    pub const fn is_security_signal(&self) -> bool {
        matches!(self, Self::Revoked | Self::AlreadyRevoked | Self::Conflict(_))
    }
}

impl From<DocumentStoreError> for StoreError {
    fn from(err: DocumentStoreError) -> Self {
        match err {
            DocumentStoreError::AlreadyExists(key) => Self::Conflict(format!("{key} already exists")),
            DocumentStoreError::FailedPrecondition { key, .. } => {
                Self::Conflict(format!("{key} changed since it was read"))
            }
            DocumentStoreError::NotFound(key) => Self::NotFound(key.to_string()),
            DocumentStoreError::SerializationError(message) => Self::Serialization(message),
            other => Self::Backend(other),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<Cancelled> for StoreError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}
