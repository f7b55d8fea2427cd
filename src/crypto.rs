//! Low-level cryptographic operations.
//!
//! This module is one of exactly two places in the crate that import `ring`
//! directly (the other is `keys`). Backends seal and open payloads
//! exclusively through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//! - **AAD**: caller-supplied binding (a fixed label for local secrets, the
//!   account id for envelope secrets)

use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, SecretsError};

const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a data or derived key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; N];
    rng.fill(&mut buf).map_err(|_| SecretsError::Crypto("randomness source failed"))?;
    Ok(buf)
}

fn key_for(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey> {
    let unbound =
        UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| SecretsError::Crypto("invalid key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal `plaintext` under `key_bytes`, binding `aad` into the tag.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext + GCM tag ]
/// ```
pub fn seal(key_bytes: &[u8; KEY_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = key_for(key_bytes)?;
    let nonce = Nonce::assume_unique_for_key(random_bytes::<NONCE_LEN>()?);

    let mut output = Vec::with_capacity(NONCE_LEN + plaintext.len() + ALGORITHM.tag_len());
    output.extend_from_slice(nonce.as_ref());
    output.extend_from_slice(plaintext);

    let tag = key
        .seal_in_place_separate_tag(nonce, aead::Aad::from(aad), &mut output[NONCE_LEN..])
        .map_err(|_| SecretsError::Crypto("sealing failed"))?;
    output.extend_from_slice(tag.as_ref());

    Ok(output)
}

/// Open a payload produced by [`seal`] with the same key and AAD.
///
/// A wrong key, wrong AAD or tampered payload fails the GCM check; no
/// partial plaintext is ever returned.
pub fn open(key_bytes: &[u8; KEY_LEN], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + ALGORITHM.tag_len() {
        return Err(SecretsError::Crypto("payload too short"));
    }

    let nonce_bytes: [u8; NONCE_LEN] = sealed[..NONCE_LEN]
        .try_into()
        .map_err(|_| SecretsError::Crypto("malformed nonce"))?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);
    let key = key_for(key_bytes)?;

    let mut payload = sealed[NONCE_LEN..].to_vec();
    let plaintext = key
        .open_in_place(nonce, aead::Aad::from(aad), &mut payload)
        .map_err(|_| SecretsError::Crypto("authentication failed"))?;

    Ok(plaintext.to_vec())
}

/// Generate a fresh random 256-bit key.
pub fn generate_key() -> Result<[u8; KEY_LEN]> {
    random_bytes::<KEY_LEN>()
}
