//! # idproxy credential stores
//!
//! Transactional lifecycle management for the credentials an identity
//! proxy issues after a successful upstream login:
//!
//! - **Refresh tokens**: create, use, rotate, revoke (single, family, user)
//!   and purge, with rotation reuse surfacing as a security signal
//! - **Access generations**: per-user counters that invalidate every
//!   outstanding access token when bumped
//! - **Sessions**: fixed-lifetime login sessions
//!
//! Every store is a stateless façade over an injected
//! [`DocumentStore`](idproxy_core::DocumentStore) and
//! [`Clock`](idproxy_core::environment::Clock). Observe-then-write operations
//! run as optimistic transactions validated against the versions they read,
//! so concurrent writers can never both win a rotation or lose a counter
//! increment.
//!
//! ## Example: Rotation
//!
//! ```rust,ignore
//! use idproxy_auth::{RefreshTokenRecord, RefreshTokenStore};
//!
//! let store = RefreshTokenStore::new(db, clock);
//! store.create(RefreshTokenRecord::new("rt-1", "user-1", digest)).await?;
//!
//! // Client presents rt-1: rotate it.
//! let next = store.replace("rt-1", RefreshTokenRecord::new("rt-2", "user-1", digest2), now).await?;
//!
//! // rt-1 presented again: theft signal.
//! let err = store.mark_used("rt-1").await.unwrap_err();
//! assert!(err.is_security_signal());
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod config;
pub mod constants;
pub mod error;
pub mod keyring;
pub mod state;
pub mod stores;
pub mod utils;

pub use config::{AccessGenerationConfig, RefreshTokenConfig, SessionConfig};
pub use error::{Result, StoreError};
pub use keyring::{TokenDigest, TokenKeyring};
pub use state::{AccessGenerationRecord, RefreshTokenRecord, Session, SessionStatus, TokenState};
pub use stores::{
    AccessGenerationStore, BulkOutcome, RefreshTokenStore, SessionStore, SessionStoreBuilder,
};
