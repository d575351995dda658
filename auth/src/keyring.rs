//! Keyed hashing of refresh token secrets.
//!
//! Refresh token secrets are never stored. The store keeps an HMAC-SHA256
//! digest together with the ID of the key that produced it, so keys can be
//! rotated without invalidating outstanding tokens:
//!
//! - New digests always use the active key
//! - Retired keys stay available for verification until removed
//! - Verification compares digests in constant time
//!
//! # Example
//!
//! ```
//! use idproxy_auth::keyring::TokenKeyring;
//!
//! let mut keyring = TokenKeyring::new("k1", b"first-key-material".to_vec())?;
//! let secret = TokenKeyring::generate_secret();
//! let stored = keyring.digest(&secret)?;
//!
//! keyring.rotate("k2", b"second-key-material".to_vec())?;
//! assert!(keyring.verify(&secret, &stored.key_id, &stored.digest));
//! assert_eq!(keyring.digest(&secret)?.key_id, "k2");
//! # Ok::<(), idproxy_auth::StoreError>(())
//! ```

use crate::error::{Result, StoreError};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in a generated token secret (256 bits).
const SECRET_BYTES: usize = 32;

/// Digest of a token secret and the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDigest {
    /// Keyring key ID.
    pub key_id: String,
    /// Base64url HMAC-SHA256 of the secret.
    pub digest: String,
}

/// HMAC keys indexed by key ID, one of them active.
#[derive(Clone)]
pub struct TokenKeyring {
    active: String,
    keys: HashMap<String, Vec<u8>>,
}

impl TokenKeyring {
    /// Create a keyring whose only (and active) key is `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if the key ID or key is empty.
    pub fn new(key_id: impl Into<String>, key: Vec<u8>) -> Result<Self> {
        let key_id = key_id.into();
        check_key(&key_id, &key)?;
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), key);
        Ok(Self { active: key_id, keys })
    }

    /// Add a new key and make it active. The previous key is retired: it
    /// still verifies but no longer signs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if the key ID or key is empty,
    /// or the key ID is already in use.
    pub fn rotate(&mut self, key_id: impl Into<String>, key: Vec<u8>) -> Result<()> {
        let key_id = key_id.into();
        check_key(&key_id, &key)?;
        if self.keys.contains_key(&key_id) {
            return Err(StoreError::InvalidConfig(format!(
                "key id {key_id:?} already in keyring"
            )));
        }
        self.keys.insert(key_id.clone(), key);
        self.active = key_id;
        Ok(())
    }

    /// Drop a retired key. Digests made with it stop verifying.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] when asked to remove the active key.
    pub fn remove(&mut self, key_id: &str) -> Result<bool> {
        if key_id == self.active {
            return Err(StoreError::InvalidConfig(
                "cannot remove the active key".to_string(),
            ));
        }
        Ok(self.keys.remove(key_id).is_some())
    }

    /// ID of the key used for new digests.
    #[must_use]
    pub fn active_key_id(&self) -> &str {
        &self.active
    }

    /// Digest `secret` with the active key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] for an empty secret.
    pub fn digest(&self, secret: &str) -> Result<TokenDigest> {
        if secret.is_empty() {
            return Err(StoreError::InvalidArgument("token secret is empty".to_string()));
        }
        let key = self
            .keys
            .get(&self.active)
            .ok_or_else(|| StoreError::InvalidConfig("active key missing".to_string()))?;
        let mac = sign(key, secret)?;
        Ok(TokenDigest {
            key_id: self.active.clone(),
            digest: URL_SAFE_NO_PAD.encode(mac),
        })
    }

    /// Check `secret` against a stored digest. Unknown key IDs never verify.
    #[must_use]
    pub fn verify(&self, secret: &str, key_id: &str, digest: &str) -> bool {
        let Some(key) = self.keys.get(key_id) else {
            return false;
        };
        let Ok(expected) = sign(key, secret) else {
            return false;
        };
        let Ok(presented) = URL_SAFE_NO_PAD.decode(digest) else {
            return false;
        };
        constant_time_eq::constant_time_eq(&expected, &presented)
    }

    /// Generate a fresh token secret: 256 random bits, base64url (43 chars).
    #[must_use]
    pub fn generate_secret() -> String {
        let mut rng = rand::thread_rng();
        let mut random_bytes = [0u8; SECRET_BYTES];
        rng.fill_bytes(&mut random_bytes);
        URL_SAFE_NO_PAD.encode(random_bytes)
    }
}

impl fmt::Debug for TokenKeyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut key_ids: Vec<&String> = self.keys.keys().collect();
        key_ids.sort();
        f.debug_struct("TokenKeyring")
            .field("active", &self.active)
            .field("key_ids", &key_ids)
            .finish_non_exhaustive()
    }
}

fn check_key(key_id: &str, key: &[u8]) -> Result<()> {
    if key_id.is_empty() {
        return Err(StoreError::InvalidConfig("key id is empty".to_string()));
    }
    if key.is_empty() {
        return Err(StoreError::InvalidConfig(format!("key {key_id:?} is empty")));
    }
    Ok(())
}

fn sign(key: &[u8], secret: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StoreError::InvalidConfig(format!("unusable HMAC key: {e}")))?;
    mac.update(secret.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keyring() -> TokenKeyring {
        TokenKeyring::new("k1", b"key-one".to_vec()).unwrap()
    }

    #[test]
    fn digest_is_deterministic_per_key() {
        let keyring = keyring();
        let a = keyring.digest("secret").unwrap();
        let b = keyring.digest("secret").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key_id, "k1");
        assert_ne!(a.digest, "secret");
    }

    #[test]
    fn verify_rejects_wrong_secret_and_unknown_key() {
        let keyring = keyring();
        let stored = keyring.digest("secret").unwrap();
        assert!(keyring.verify("secret", "k1", &stored.digest));
        assert!(!keyring.verify("other", "k1", &stored.digest));
        assert!(!keyring.verify("secret", "k9", &stored.digest));
        assert!(!keyring.verify("secret", "k1", "not base64 !"));
    }

    #[test]
    fn retired_keys_still_verify() {
        let mut keyring = keyring();
        let old = keyring.digest("secret").unwrap();
        keyring.rotate("k2", b"key-two".to_vec()).unwrap();

        assert_eq!(keyring.active_key_id(), "k2");
        assert!(keyring.verify("secret", &old.key_id, &old.digest));
        assert_ne!(keyring.digest("secret").unwrap().digest, old.digest);

        assert!(keyring.remove("k1").unwrap());
        assert!(!keyring.verify("secret", &old.key_id, &old.digest));
        assert!(keyring.remove("k2").is_err());
    }

    #[test]
    fn rotate_rejects_duplicate_and_empty_keys() {
        let mut keyring = keyring();
        assert!(keyring.rotate("k1", b"again".to_vec()).is_err());
        assert!(keyring.rotate("k2", Vec::new()).is_err());
        assert!(TokenKeyring::new("", b"x".to_vec()).is_err());
    }

    #[test]
    fn generated_secrets_are_unique_256_bit() {
        let a = TokenKeyring::generate_secret();
        let b = TokenKeyring::generate_secret();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }

    #[test]
    fn debug_hides_key_material() {
        let rendered = format!("{:?}", keyring());
        assert!(rendered.contains("k1"));
        assert!(!rendered.contains("key-one"));
    }
}
