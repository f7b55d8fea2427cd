//! Remote secret-engine backend.
//!
//! Values are written to the engine under a logical path
//! `<base_path>/<KIND>/<name>`; the record keeps only that path, so the
//! secret can also be rotated directly in the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SecretsError};
use crate::model::{
    Credentials, EncryptedData, EncryptionConfig, EncryptionType, Sealed, VaultCredentials,
};

use super::{EncryptRequest, EncryptionBackend};

/// RPC surface of a secret-engine service.
pub trait VaultClient: Send + Sync {
    fn write(&self, credentials: &VaultCredentials, path: &str, value: &str) -> Result<()>;

    fn read(&self, credentials: &VaultCredentials, path: &str) -> Result<Option<String>>;

    fn delete(&self, credentials: &VaultCredentials, path: &str) -> Result<()>;
}

impl<T: VaultClient + ?Sized> VaultClient for Arc<T> {
    fn write(&self, credentials: &VaultCredentials, path: &str, value: &str) -> Result<()> {
        (**self).write(credentials, path, value)
    }

    fn read(&self, credentials: &VaultCredentials, path: &str) -> Result<Option<String>> {
        (**self).read(credentials, path)
    }

    fn delete(&self, credentials: &VaultCredentials, path: &str) -> Result<()> {
        (**self).delete(credentials, path)
    }
}

pub struct VaultBackend<C> {
    client: C,
}

impl<C: VaultClient> VaultBackend<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

fn vault_credentials(config: &EncryptionConfig) -> Result<&VaultCredentials> {
    match &config.credentials {
        Credentials::Vault(creds) => Ok(creds),
        other => Err(SecretsError::operation(
            EncryptionType::Vault,
            format!("config {} is a {} config", config.id, other.encryption_type()),
        )),
    }
}

fn tag_vault(err: SecretsError) -> SecretsError {
    match err {
        SecretsError::Operation { .. } => err,
        other => SecretsError::operation(EncryptionType::Vault, other.to_string()),
    }
}

/// Path for a new secret. The short suffix keeps equally named secrets of
/// different owners apart.
fn new_secret_path(creds: &VaultCredentials, request: &EncryptRequest<'_>) -> String {
    let name: String = request
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}/{}_{}",
        creds.base_path.trim_end_matches('/'),
        request.kind.path_segment(),
        name,
        &suffix[..8]
    )
}

impl<C: VaultClient> EncryptionBackend for VaultBackend<C> {
    fn encryption_type(&self) -> EncryptionType {
        EncryptionType::Vault
    }

    fn encrypt(&self, request: &EncryptRequest<'_>, config: &EncryptionConfig) -> Result<Sealed> {
        let creds = vault_credentials(config)?;
        if creds.read_only {
            return Err(SecretsError::operation(
                EncryptionType::Vault,
                format!("vault {} is read only", config.name),
            ));
        }

        // Re-encrypting a record that already lives in this engine keeps its path.
        let path = match request.existing {
            Some(existing)
                if existing.encryption_type == EncryptionType::Vault
                    && existing.kms_id == config.id
                    && !existing.encryption_key.is_empty() =>
            {
                existing.encryption_key.clone()
            }
            _ => new_secret_path(creds, request),
        };

        let Some(plaintext) = request.plaintext else {
            // Emptying a stored secret must not leave the old value behind.
            let stored = request
                .existing
                .is_some_and(|e| e.encrypted_value.is_some() && e.encryption_key == path);
            if stored {
                self.client.delete(creds, &path).map_err(tag_vault)?;
                debug!(account_id = request.account_id, path = %path, "cleared secret in vault");
            }
            return Ok(Sealed {
                encrypted_value: None,
                encryption_key: path,
            });
        };

        self.client
            .write(creds, &path, &STANDARD.encode(plaintext))
            .map_err(tag_vault)?;
        info!(
            account_id = request.account_id,
            vault = %config.name,
            path = %path,
            "saved secret into vault"
        );
        Ok(Sealed {
            encrypted_value: Some(path.clone().into_bytes()),
            encryption_key: path,
        })
    }

    fn decrypt(
        &self,
        record: &EncryptedData,
        config: &EncryptionConfig,
    ) -> Result<Option<Vec<u8>>> {
        let creds = vault_credentials(config)?;
        let path = match (&record.path, &record.encrypted_value) {
            (Some(path), _) => path.clone(),
            (None, Some(_)) => record.encryption_key.clone(),
            (None, None) => return Ok(None),
        };
        let stored = self
            .client
            .read(creds, &path)
            .map_err(tag_vault)?
            .ok_or_else(|| {
                SecretsError::operation(EncryptionType::Vault, format!("no secret at path {path}"))
            })?;
        debug!(record_id = %record.id, path = %path, "read secret from vault");
        STANDARD
            .decode(stored.as_bytes())
            .map(Some)
            .map_err(|e| {
                SecretsError::operation(
                    EncryptionType::Vault,
                    format!("malformed value at {path}: {e}"),
                )
            })
    }

    fn remove(&self, record: &EncryptedData, config: &EncryptionConfig) -> Result<()> {
        // Path references point at secrets this system does not own.
        if record.is_path_reference() || record.encrypted_value.is_none() {
            return Ok(());
        }
        let creds = vault_credentials(config)?;
        if creds.read_only {
            return Ok(());
        }
        self.client
            .delete(creds, &record.encryption_key)
            .map_err(tag_vault)
    }

    fn validate(&self, config: &EncryptionConfig) -> Result<()> {
        let creds = vault_credentials(config)?;
        if creds.read_only {
            // Nothing may be written; a read proves the token is accepted.
            return self.client.read(creds, &creds.base_path).map(|_| ()).map_err(tag_vault);
        }
        super::validate_round_trip(self, config)
    }
}

// ---------------------------------------------------------------------------
// In-process service
// ---------------------------------------------------------------------------

/// An in-process secret engine for tests and demos. Requests must carry a
/// registered token.
#[derive(Default)]
pub struct InMemoryVault {
    tokens: RwLock<Vec<String>>,
    secrets: RwLock<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&self, token: &str) {
        self.tokens.write().push(token.to_string());
    }

    pub fn revoke_token(&self, token: &str) {
        self.tokens.write().retain(|t| t != token);
    }

    /// Number of secrets currently stored.
    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn authorize(&self, creds: &VaultCredentials) -> Result<()> {
        if creds.vault_url.trim().is_empty() {
            return Err(SecretsError::operation(EncryptionType::Vault, "vault url is empty"));
        }
        if self.tokens.read().iter().any(|t| t == &creds.auth_token) {
            Ok(())
        } else {
            Err(SecretsError::operation(EncryptionType::Vault, "permission denied: invalid token"))
        }
    }
}

impl VaultClient for InMemoryVault {
    fn write(&self, credentials: &VaultCredentials, path: &str, value: &str) -> Result<()> {
        self.authorize(credentials)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.secrets.write().insert(path.to_string(), value.to_string());
        Ok(())
    }

    fn read(&self, credentials: &VaultCredentials, path: &str) -> Result<Option<String>> {
        self.authorize(credentials)?;
        Ok(self.secrets.read().get(path).cloned())
    }

    fn delete(&self, credentials: &VaultCredentials, path: &str) -> Result<()> {
        self.authorize(credentials)?;
        self.secrets.write().remove(path);
        Ok(())
    }
}
