//! Pluggable encryption backends.
//!
//! Every backend implements the same small contract. Which backend handles
//! a record is decided by the `encryption_type` stored on the record, never
//! by the account's current default, so records keep working under their
//! original backend until a transition moves them.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Result, SecretsError};
use crate::model::{EncryptedData, EncryptionConfig, EncryptionType, Sealed, SecretKind};

pub mod kms;
pub mod local;
pub mod vault;

pub use kms::{DataKey, InMemoryKms, KmsBackend, KmsClient};
pub use local::LocalBackend;
pub use vault::{InMemoryVault, VaultBackend, VaultClient};

/// Input to [`EncryptionBackend::encrypt`].
#[derive(Debug, Clone, Copy)]
pub struct EncryptRequest<'a> {
    pub account_id: &'a str,
    /// Logical secret name; secret-engine backends derive their path from it.
    pub name: &'a str,
    pub kind: SecretKind,
    /// `None` stores a configured-but-empty secret.
    pub plaintext: Option<&'a [u8]>,
    /// The record being re-encrypted, if any.
    pub existing: Option<&'a EncryptedData>,
}

/// Uniform encrypt/decrypt contract implemented per backend variant.
pub trait EncryptionBackend: Send + Sync {
    fn encryption_type(&self) -> EncryptionType;

    fn encrypt(&self, request: &EncryptRequest<'_>, config: &EncryptionConfig) -> Result<Sealed>;

    /// Returns `None` for a record stored with null ciphertext.
    fn decrypt(&self, record: &EncryptedData, config: &EncryptionConfig) -> Result<Option<Vec<u8>>>;

    /// Remove any artifact the backend keeps outside the record.
    fn remove(&self, _record: &EncryptedData, _config: &EncryptionConfig) -> Result<()> {
        Ok(())
    }

    /// Check that the config is usable. Defaults to a full round trip.
    fn validate(&self, config: &EncryptionConfig) -> Result<()> {
        validate_round_trip(self, config)
    }
}

impl<T> EncryptionBackend for Arc<T>
where
    T: EncryptionBackend + ?Sized,
{
    fn encryption_type(&self) -> EncryptionType {
        (**self).encryption_type()
    }

    fn encrypt(&self, request: &EncryptRequest<'_>, config: &EncryptionConfig) -> Result<Sealed> {
        (**self).encrypt(request, config)
    }

    fn decrypt(
        &self,
        record: &EncryptedData,
        config: &EncryptionConfig,
    ) -> Result<Option<Vec<u8>>> {
        (**self).decrypt(record, config)
    }

    fn remove(&self, record: &EncryptedData, config: &EncryptionConfig) -> Result<()> {
        (**self).remove(record, config)
    }

    fn validate(&self, config: &EncryptionConfig) -> Result<()> {
        (**self).validate(config)
    }
}

/// Backend lookup by encryption type. The local backend is always present.
#[derive(Clone)]
pub struct Backends {
    by_type: HashMap<EncryptionType, Arc<dyn EncryptionBackend>>,
}

impl Default for Backends {
    fn default() -> Self {
        Self::new()
    }
}

impl Backends {
    pub fn new() -> Self {
        let mut by_type: HashMap<EncryptionType, Arc<dyn EncryptionBackend>> = HashMap::new();
        by_type.insert(EncryptionType::Local, Arc::new(LocalBackend::new()));
        Self { by_type }
    }

    /// Register (or replace) the backend for its encryption type.
    pub fn with(mut self, backend: Arc<dyn EncryptionBackend>) -> Self {
        self.by_type.insert(backend.encryption_type(), backend);
        self
    }

    pub fn get(&self, encryption_type: EncryptionType) -> Result<Arc<dyn EncryptionBackend>> {
        self.by_type.get(&encryption_type).cloned().ok_or_else(|| {
            SecretsError::operation(encryption_type, "no backend registered for this type")
        })
    }
}

/// Smoke-test a config with a real encrypt/decrypt round trip.
pub(crate) fn validate_round_trip<B>(backend: &B, config: &EncryptionConfig) -> Result<()>
where
    B: EncryptionBackend + ?Sized,
{
    let sample = Uuid::new_v4().to_string();
    let name = format!("validation_{}", Uuid::new_v4().simple());
    let request = EncryptRequest {
        account_id: &config.account_id,
        name: &name,
        kind: SecretKind::ManagerCredential,
        plaintext: Some(sample.as_bytes()),
        existing: None,
    };
    let sealed = backend.encrypt(&request, config)?;
    let record = sample_record(config, sealed);
    let decrypted = backend.decrypt(&record, config);
    // The sample is never persisted; clean up whatever the backend wrote.
    backend.remove(&record, config)?;

    match decrypted? {
        Some(bytes) if bytes == sample.as_bytes() => Ok(()),
        _ => Err(SecretsError::operation(
            config.encryption_type(),
            "round trip returned a different value",
        )),
    }
}

fn sample_record(config: &EncryptionConfig, sealed: Sealed) -> EncryptedData {
    let now = chrono::Utc::now();
    EncryptedData {
        id: String::new(),
        account_id: config.account_id.clone(),
        name: String::new(),
        kind: SecretKind::ManagerCredential,
        encryption_type: config.encryption_type(),
        encrypted_value: sealed.encrypted_value,
        encryption_key: sealed.encryption_key,
        kms_id: config.id.clone(),
        parent_ids: Default::default(),
        path: None,
        enabled: true,
        created_at: now,
        created_by: None,
        last_updated_at: now,
        encrypted_by: None,
    }
}
