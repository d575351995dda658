//! # idproxy runtime
//!
//! Execution helpers shared by the credential stores.
//!
//! Today this is the retry machinery: a single, generic backoff loop
//! parameterized by the operation and by the predicate that decides which
//! failures are transient. The stores use it twice, to re-run aborted
//! transactions and to serialize contended generation bumps.

/// Retry logic with exponential backoff
pub mod retry;

pub use retry::{Cancelled, RetryPolicy, RetryPolicyBuilder, retry_until_cancelled, retry_with_predicate};
