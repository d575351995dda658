//! Input validation helpers shared by the stores.

use crate::constants::{MAX_ID_BYTES, PATH_SEPARATOR};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};

/// Validate a document ID.
///
/// An ID is rejected when it is empty, contains the path separator `/`, is
/// one of the relative path segments `.` / `..`, or exceeds 1500 bytes.
///
/// # Errors
///
/// Returns [`StoreError::InvalidId`] for a rejected ID.
///
/// # Examples
///
/// ```
/// use idproxy_auth::utils::validate_id;
///
/// assert!(validate_id("rt-1").is_ok());
/// assert!(validate_id("").is_err());
/// assert!(validate_id("users/rt-1").is_err());
/// ```
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.contains(PATH_SEPARATOR)
        || id == "."
        || id == ".."
        || id.len() > MAX_ID_BYTES
    {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Timestamp as integer microseconds since the Unix epoch, the unit every
/// persisted time field uses.
#[must_use]
pub fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

/// Whether `at` is the zero instant (or earlier).
#[must_use]
pub fn is_zero_instant(at: DateTime<Utc>) -> bool {
    at.timestamp_micros() <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_rejects_separators_and_dots() {
        assert!(validate_id("abc-123").is_ok());
        assert_eq!(validate_id("a/b"), Err(StoreError::InvalidId("a/b".to_string())));
        assert!(validate_id(".").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_BYTES + 1)).is_err());
    }

    #[test]
    fn test_zero_instant() {
        assert!(is_zero_instant(DateTime::<Utc>::UNIX_EPOCH));
        assert!(!is_zero_instant(Utc::now()));
    }
}
