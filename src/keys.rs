//! Key derivation and ownership.
//!
//! Two responsibilities:
//! 1. Deriving the per-account key used by the local backend, with
//!    HKDF-SHA256.
//! 2. Holding key material (derived keys and unwrapped KMS data keys) in
//!    types that are opaque, non-cloneable and zeroised on drop.
//!
//! This is one of exactly two modules permitted to import `ring` directly
//! (the other is `crypto`).
//!
//! ## Derivation structure
//!
//! ```text
//! HKDF-SHA256(
//!     ikm  = account_id,
//!     salt = LOCAL_SALT,
//!     info = "local:{account_id}"
//! )
//! ```
//!
//! The local key is a deterministic function of the account id: any
//! process can decrypt local secrets without shared state. It obscures
//! values at rest and is not a substitute for a remote KMS.

use ring::hkdf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_LEN;
use crate::error::{Result, SecretsError};

const LOCAL_SALT: &[u8] = b"secretkeeper.local.v1";

/// Raw 256-bit key material.
///
/// - Not `Clone`.
/// - Zeroised on drop.
/// - Bytes are only reachable inside the crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Wrap key bytes, e.g. a data key returned by a KMS.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Accept a variable-length slice from a remote service.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SecretsError::Crypto("invalid key length"))?;
        Ok(Self { bytes })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// Derive the local-backend key for an account.
pub(crate) fn derive_local_key(account_id: &str) -> Result<KeyMaterial> {
    let info = format!("local:{}", account_id);

    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, LOCAL_SALT);
    let prk = salt.extract(account_id.as_bytes());

    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, hkdf::HKDF_SHA256)
        .map_err(|_| SecretsError::Crypto("key derivation failed"))?;

    let mut derived = [0u8; KEY_LEN];
    okm.fill(&mut derived)
        .map_err(|_| SecretsError::Crypto("key derivation failed"))?;

    Ok(KeyMaterial { bytes: derived })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_key_is_deterministic_per_account() {
        let a1 = derive_local_key("acct-a").unwrap();
        let a2 = derive_local_key("acct-a").unwrap();
        let b = derive_local_key("acct-b").unwrap();
        assert_eq!(a1.as_bytes(), a2.as_bytes());
        assert_ne!(a1.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_from_slice_rejects_short_key() {
        assert!(KeyMaterial::from_slice(&[1u8; 16]).is_err());
    }
}
