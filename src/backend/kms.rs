//! Remote envelope-encryption backend.
//!
//! The remote service only ever sees data keys: each secret is sealed
//! locally under a fresh data key, and the service-wrapped copy of that key
//! is stored as the record's key reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::crypto;
use crate::error::{Result, SecretsError};
use crate::keys::KeyMaterial;
use crate::model::{
    Credentials, EncryptedData, EncryptionConfig, EncryptionType, KmsCredentials, Sealed,
};

use super::{EncryptRequest, EncryptionBackend};

/// A data key as returned by the service: usable plaintext plus the
/// wrapped blob that only the service can unwrap.
#[derive(Debug)]
pub struct DataKey {
    pub plaintext: KeyMaterial,
    pub ciphertext_blob: Vec<u8>,
}

/// RPC surface of an envelope-encryption service.
pub trait KmsClient: Send + Sync {
    fn generate_data_key(&self, credentials: &KmsCredentials) -> Result<DataKey>;

    fn decrypt_data_key(
        &self,
        credentials: &KmsCredentials,
        ciphertext_blob: &[u8],
    ) -> Result<KeyMaterial>;
}

pub struct KmsBackend<C> {
    client: C,
}

impl<C: KmsClient> KmsBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

fn kms_credentials(config: &EncryptionConfig) -> Result<&KmsCredentials> {
    match &config.credentials {
        Credentials::Kms(creds) => Ok(creds),
        other => Err(SecretsError::operation(
            EncryptionType::Kms,
            format!("config {} is a {} config", config.id, other.encryption_type()),
        )),
    }
}

fn tag_kms(err: SecretsError) -> SecretsError {
    match err {
        SecretsError::Operation { .. } => err,
        other => SecretsError::operation(EncryptionType::Kms, other.to_string()),
    }
}

impl<C: KmsClient> EncryptionBackend for KmsBackend<C> {
    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Kms
    }

    fn encrypt(&self, request: &EncryptRequest<'_>, config: &EncryptionConfig) -> Result<Sealed> {
        let Some(plaintext) = request.plaintext else {
            // Configured-but-empty: no RPC, but still a key reference.
            return Ok(Sealed {
                encrypted_value: None,
                encryption_key: Uuid::new_v4().to_string(),
            });
        };
        let creds = kms_credentials(config)?;
        let data_key = self.client.generate_data_key(creds).map_err(tag_kms)?;
        let sealed = crypto::seal(
            data_key.plaintext.as_bytes(),
            request.account_id.as_bytes(),
            plaintext,
        )
        .map_err(tag_kms)?;
        debug!(
            account_id = request.account_id,
            kms_id = %config.id,
            "sealed secret with kms data key"
        );
        Ok(Sealed {
            encrypted_value: Some(sealed),
            encryption_key: STANDARD.encode(&data_key.ciphertext_blob),
        })
    }

    fn decrypt(
        &self,
        record: &EncryptedData,
        config: &EncryptionConfig,
    ) -> Result<Option<Vec<u8>>> {
        let Some(sealed) = record.encrypted_value.as_deref() else {
            return Ok(None);
        };
        let creds = kms_credentials(config)?;
        let blob = STANDARD.decode(&record.encryption_key).map_err(|e| {
            SecretsError::operation(EncryptionType::Kms, format!("malformed data key: {e}"))
        })?;
        let data_key = self.client.decrypt_data_key(creds, &blob).map_err(tag_kms)?;
        crypto::open(data_key.as_bytes(), record.account_id.as_bytes(), sealed).map(Some)
    }
}

// ---------------------------------------------------------------------------
// In-process service
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct WrappedBlob {
    arn: String,
    wrapped: Vec<u8>,
}

/// An in-process envelope-encryption service for tests, demos and
/// air-gapped deployments. Keys are addressed by ARN
/// (`arn:aws:kms:<region>:<account>:key/<id>`) and access is checked
/// against registered access/secret key pairs.
#[derive(Default)]
pub struct InMemoryKms {
    principals: RwLock<HashMap<String, String>>,
    master_keys: RwLock<HashMap<String, KeyMaterial>>,
    calls: AtomicUsize,
}

impl InMemoryKms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow an access/secret key pair.
    pub fn add_principal(&self, access_key: &str, secret_key: &str) {
        self.principals
            .write()
            .insert(access_key.to_string(), secret_key.to_string());
    }

    /// Create a master key and return its ARN.
    pub fn create_key(&self, region: &str) -> Result<String> {
        let arn = format!("arn:aws:kms:{region}:000000000000:key/{}", Uuid::new_v4());
        let key = KeyMaterial::from_bytes(crypto::generate_key()?);
        self.master_keys.write().insert(arn.clone(), key);
        Ok(arn)
    }

    /// Drop a master key; data keys wrapped by it can no longer be unwrapped.
    pub fn schedule_key_deletion(&self, arn: &str) -> bool {
        self.master_keys.write().remove(arn).is_some()
    }

    /// Number of RPCs served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn authorize(&self, creds: &KmsCredentials) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.principals.read().get(&creds.access_key) {
            Some(secret) if secret == &creds.secret_key => Ok(()),
            Some(_) => Err(SecretsError::operation(
                EncryptionType::Kms,
                "the request signature does not match",
            )),
            None => Err(SecretsError::operation(
                EncryptionType::Kms,
                "the security token included in the request is invalid",
            )),
        }
    }

    fn validate_arn(arn: &str) -> Result<()> {
        let parts: Vec<&str> = arn.splitn(6, ':').collect();
        let well_formed = parts.len() == 6
            && parts[0] == "arn"
            && parts[2] == "kms"
            && !parts[3].is_empty()
            && parts[5].starts_with("key/")
            && parts[5].len() > "key/".len();
        if well_formed {
            Ok(())
        } else {
            Err(SecretsError::operation(
                EncryptionType::Kms,
                format!("invalid key ARN: {arn}"),
            ))
        }
    }

    fn with_master_key<T>(
        &self,
        arn: &str,
        f: impl FnOnce(&KeyMaterial) -> Result<T>,
    ) -> Result<T> {
        Self::validate_arn(arn)?;
        let keys = self.master_keys.read();
        let key = keys.get(arn).ok_or_else(|| {
            SecretsError::operation(EncryptionType::Kms, format!("key not found: {arn}"))
        })?;
        f(key)
    }
}

impl KmsClient for InMemoryKms {
    fn generate_data_key(&self, credentials: &KmsCredentials) -> Result<DataKey> {
        self.authorize(credentials)?;
        let arn = credentials.kms_arn.as_str();
        let dek = crypto::generate_key()?;
        let wrapped = self.with_master_key(arn, |master| {
            crypto::seal(master.as_bytes(), arn.as_bytes(), &dek)
        })?;
        let blob = serde_json::to_vec(&WrappedBlob {
            arn: arn.to_string(),
            wrapped,
        })?;
        Ok(DataKey {
            plaintext: KeyMaterial::from_bytes(dek),
            ciphertext_blob: blob,
        })
    }

    fn decrypt_data_key(
        &self,
        credentials: &KmsCredentials,
        ciphertext_blob: &[u8],
    ) -> Result<KeyMaterial> {
        self.authorize(credentials)?;
        let blob: WrappedBlob = serde_json::from_slice(ciphertext_blob)
            .map_err(|_| SecretsError::operation(EncryptionType::Kms, "invalid ciphertext blob"))?;
        if blob.arn != credentials.kms_arn {
            return Err(SecretsError::operation(
                EncryptionType::Kms,
                "ciphertext was wrapped by a different key",
            ));
        }
        let dek = self.with_master_key(&blob.arn, |master| {
            crypto::open(master.as_bytes(), blob.arn.as_bytes(), &blob.wrapped)
        })?;
        KeyMaterial::from_slice(&dek)
    }
}

impl<T: KmsClient + ?Sized> KmsClient for std::sync::Arc<T> {
    fn generate_data_key(&self, credentials: &KmsCredentials) -> Result<DataKey> {
        (**self).generate_data_key(credentials)
    }

    fn decrypt_data_key(
        &self,
        credentials: &KmsCredentials,
        ciphertext_blob: &[u8],
    ) -> Result<KeyMaterial> {
        (**self).decrypt_data_key(credentials, ciphertext_blob)
    }
}
