//! Local backend: values sealed with a key derived from the account id.
//!
//! Used when an account has no remote manager configured, and for the
//! credentials of remote managers themselves.

use crate::crypto;
use crate::error::{Result, SecretsError};
use crate::keys::derive_local_key;
use crate::model::{EncryptedData, EncryptionConfig, EncryptionType, Sealed};

use super::{EncryptRequest, EncryptionBackend};

const LOCAL_AAD: &[u8] = b"secretkeeper.local";

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl EncryptionBackend for LocalBackend {
    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Local
    }

    fn encrypt(&self, request: &EncryptRequest<'_>, _config: &EncryptionConfig) -> Result<Sealed> {
        let encrypted_value = match request.plaintext {
            Some(plaintext) => {
                let key = derive_local_key(request.account_id)?;
                Some(crypto::seal(key.as_bytes(), LOCAL_AAD, plaintext)?)
            }
            None => None,
        };
        Ok(Sealed {
            encrypted_value,
            encryption_key: request.account_id.to_string(),
        })
    }

    fn decrypt(
        &self,
        record: &EncryptedData,
        _config: &EncryptionConfig,
    ) -> Result<Option<Vec<u8>>> {
        let Some(sealed) = record.encrypted_value.as_deref() else {
            return Ok(None);
        };
        // The key reference of a local record is the account it was sealed for.
        let key = derive_local_key(&record.encryption_key)?;
        crypto::open(key.as_bytes(), LOCAL_AAD, sealed)
            .map(Some)
            .map_err(|_| SecretsError::Crypto("malformed local ciphertext"))
    }
}
