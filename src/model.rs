//! Persisted and exchanged data types.
//!
//! These mirror the stored collections: `encryption_configs`,
//! `encrypted_data`, and the audit collections in [`crate::audit`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SecretsError};

/// Display name of the built-in local manager.
pub const LOCAL_SECRET_MANAGER_NAME: &str = "Local Secret Manager";

/// Backend family that produced a ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionType {
    Local,
    Kms,
    Vault,
}

impl EncryptionType {
    /// Prefix used in secret reference tokens.
    pub fn yaml_name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Kms => "amazonkms",
            Self::Vault => "hashicorpvault",
        }
    }

    fn from_yaml_name(name: &str) -> Option<Self> {
        match name {
            "local" => Some(Self::Local),
            "amazonkms" => Some(Self::Kms),
            "hashicorpvault" => Some(Self::Vault),
            _ => None,
        }
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "LOCAL"),
            Self::Kms => write!(f, "KMS"),
            Self::Vault => write!(f, "VAULT"),
        }
    }
}

/// What kind of secret a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecretKind {
    /// A credential field of an application setting.
    SettingField,
    /// An uploaded file.
    ConfigFile,
    /// A free-standing secret created on its own and referenced by token.
    SecretText,
    /// An encrypted service variable.
    ServiceVariable,
    /// A credential of an encryption config itself.
    ManagerCredential,
}

impl SecretKind {
    /// Standalone records outlive their owners and are only removed by an
    /// explicit delete.
    pub fn is_standalone(&self) -> bool {
        matches!(self, Self::SecretText | Self::ConfigFile)
    }

    pub(crate) fn path_segment(&self) -> &'static str {
        match self {
            Self::SettingField => "SETTING_FIELD",
            Self::ConfigFile => "CONFIG_FILE",
            Self::SecretText => "SECRET_TEXT",
            Self::ServiceVariable => "SERVICE_VARIABLE",
            Self::ManagerCredential => "MANAGER_CREDENTIAL",
        }
    }
}

/// An opaque business entity that holds a reference to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub id: String,
    pub kind: SecretKind,
}

impl OwnerRef {
    pub fn new(id: impl Into<String>, kind: SecretKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Who performed a mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }

    /// Actor used by internal jobs.
    pub fn system() -> Self {
        Self::new("system", "System", "")
    }
}

/// Execution context a decrypt happened in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageContext {
    pub workflow_execution_id: Option<String>,
    pub app_id: Option<String>,
    pub env_id: Option<String>,
}

impl UsageContext {
    pub fn workflow(
        workflow_execution_id: impl Into<String>,
        app_id: impl Into<String>,
        env_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_execution_id: Some(workflow_execution_id.into()),
            app_id: Some(app_id.into()),
            env_id: Some(env_id.into()),
        }
    }
}

/// Credentials of a remote envelope-encryption service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub kms_arn: String,
    pub region: String,
}

/// Credentials of a remote secret-engine service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultCredentials {
    pub vault_url: String,
    pub auth_token: String,
    pub base_path: String,
    pub read_only: bool,
}

/// Backend-specific part of a config.
///
/// In a persisted config the secret fields hold ids of `ManagerCredential`
/// records, not values. Callers only ever see them unmasked (internal path)
/// or masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Credentials {
    Local,
    Kms(KmsCredentials),
    Vault(VaultCredentials),
}

impl Credentials {
    pub fn encryption_type(&self) -> EncryptionType {
        match self {
            Self::Local => EncryptionType::Local,
            Self::Kms(_) => EncryptionType::Kms,
            Self::Vault(_) => EncryptionType::Vault,
        }
    }

    /// Secret fields by stable name. Name and URL-like fields are not
    /// included.
    pub(crate) fn secret_fields(&self) -> Vec<(&'static str, &String)> {
        match self {
            Self::Local => Vec::new(),
            Self::Kms(kms) => vec![
                ("access_key", &kms.access_key),
                ("secret_key", &kms.secret_key),
                ("kms_arn", &kms.kms_arn),
            ],
            Self::Vault(vault) => vec![("auth_token", &vault.auth_token)],
        }
    }

    pub(crate) fn secret_fields_mut(&mut self) -> Vec<(&'static str, &mut String)> {
        match self {
            Self::Local => Vec::new(),
            Self::Kms(kms) => vec![
                ("access_key", &mut kms.access_key),
                ("secret_key", &mut kms.secret_key),
                ("kms_arn", &mut kms.kms_arn),
            ],
            Self::Vault(vault) => vec![("auth_token", &mut vault.auth_token)],
        }
    }

    pub(crate) fn mask(&mut self, token: &str) {
        for (_, value) in self.secret_fields_mut() {
            *value = token.to_string();
        }
    }
}

/// A configured backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Empty until first saved.
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub is_default: bool,
    pub credentials: Credentials,
    pub created_at: DateTime<Utc>,
    /// Computed on read: records currently encrypted by this config.
    #[serde(default)]
    pub num_of_encrypted_value: usize,
}

impl EncryptionConfig {
    fn new(account_id: &str, name: &str, credentials: Credentials) -> Self {
        Self {
            id: String::new(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            is_default: false,
            credentials,
            created_at: Utc::now(),
            num_of_encrypted_value: 0,
        }
    }

    /// A new, unsaved KMS config.
    pub fn kms(account_id: &str, name: &str, credentials: KmsCredentials) -> Self {
        Self::new(account_id, name, Credentials::Kms(credentials))
    }

    /// A new, unsaved Vault config.
    pub fn vault(account_id: &str, name: &str, credentials: VaultCredentials) -> Self {
        Self::new(account_id, name, Credentials::Vault(credentials))
    }

    /// The built-in local manager of an account. Its id is the account id.
    pub fn local(account_id: &str) -> Self {
        let mut config = Self::new(account_id, LOCAL_SECRET_MANAGER_NAME, Credentials::Local);
        config.id = account_id.to_string();
        config
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn encryption_type(&self) -> EncryptionType {
        self.credentials.encryption_type()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(&self.credentials, Credentials::Vault(v) if v.read_only)
    }
}

/// One stored ciphertext, possibly shared by several owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub kind: SecretKind,
    pub encryption_type: EncryptionType,
    /// `None` for a secret that is configured but empty.
    pub encrypted_value: Option<Vec<u8>>,
    /// Backend key reference: account id, wrapped data key, or Vault path.
    pub encryption_key: String,
    /// Owning config id. The account id for local records.
    pub kms_id: String,
    pub parent_ids: BTreeSet<String>,
    /// Reference to a secret managed outside this system.
    pub path: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<Actor>,
    pub last_updated_at: DateTime<Utc>,
    /// Display name of the owning config; only filled on masked listings.
    #[serde(default)]
    pub encrypted_by: Option<String>,
}

impl EncryptedData {
    pub fn is_path_reference(&self) -> bool {
        self.path.is_some()
    }
}

/// Ciphertext and key reference produced by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub encrypted_value: Option<Vec<u8>>,
    pub encryption_key: String,
}

/// Token naming an existing record so another owner can reuse it without
/// re-supplying plaintext: `<backend yaml name>:<record id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub encryption_type: EncryptionType,
    pub record_id: String,
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.encryption_type.yaml_name(), self.record_id)
    }
}

impl FromStr for SecretRef {
    type Err = SecretsError;

    fn from_str(token: &str) -> Result<Self> {
        let (prefix, record_id) = token.split_once(':').ok_or_else(|| {
            SecretsError::Validation(format!("malformed secret reference: {token}"))
        })?;
        let encryption_type = EncryptionType::from_yaml_name(prefix)
            .ok_or_else(|| SecretsError::Validation(format!("unknown secret manager: {prefix}")))?;
        if record_id.is_empty() {
            return Err(SecretsError::Validation("secret reference has no id".into()));
        }
        Ok(Self {
            encryption_type,
            record_id: record_id.to_string(),
        })
    }
}

/// Offset/limit window over a newest-first listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, 50)
    }
}

/// One page of results plus the total size of the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}
