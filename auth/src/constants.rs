//! Store constants.
//!
//! Collection names, batch ceilings and well-known revocation reasons used
//! throughout the credential stores.

/// Default collection names.
pub mod collections {
    /// Refresh token records, keyed by `refresh_id`.
    pub const REFRESH_TOKENS: &str = "refresh_tokens";

    /// Access generation counters, keyed by `user_id`.
    pub const ACCESS_GENERATIONS: &str = "access_generations";

    /// Login sessions, keyed by `session_id`.
    pub const SESSIONS: &str = "sessions";
}

/// Largest number of documents deleted per batch (the usual document
/// database write-batch ceiling).
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Separator that document IDs must not contain.
pub const PATH_SEPARATOR: char = '/';

/// Longest document ID accepted, in bytes.
pub const MAX_ID_BYTES: usize = 1500;

/// Revocation reasons recorded in `revoke_reason`.
pub mod revoke_reasons {
    /// User signed out.
    pub const LOGOUT: &str = "logout";

    /// A rotated-away token was presented again.
    pub const REUSE_DETECTED: &str = "reuse_detected";

    /// Administrative or security-event revocation.
    pub const SECURITY_EVENT: &str = "security_event";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_constants() {
        assert_eq!(collections::REFRESH_TOKENS, "refresh_tokens");
        assert_eq!(collections::ACCESS_GENERATIONS, "access_generations");
        assert_eq!(collections::SESSIONS, "sessions");
    }
}
