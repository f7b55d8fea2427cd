//! Secret-manager configurations.
//!
//! A config names a remote backend instance and carries its credentials.
//! Each account may own several configs, at most one of them default. Configs
//! owned by the global account are the fallback for accounts without a
//! default of their own.
//!
//! Credential values never sit in a persisted config: every secret field is
//! stored as a locally encrypted `ManagerCredential` record parented by the
//! config, and the config field holds that record's id.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backends, EncryptRequest, EncryptionBackend};
use crate::config::{Entitlements, ManagerLimit, SecretsSettings};
use crate::error::{Result, SecretsError};
use crate::model::{
    Credentials, EncryptedData, EncryptionConfig, EncryptionType, SecretKind,
    LOCAL_SECRET_MANAGER_NAME,
};
use crate::store::{DataFilter, SecretStore};

/// Credentials of a config may themselves be encrypted by another config.
/// Chains longer than this are rejected.
const MAX_CREDENTIAL_DEPTH: usize = 4;

const DEFAULT_KMS_REGION: &str = "us-east-1";
const DEFAULT_VAULT_BASE_PATH: &str = "secrets";

/// Result of smoke-testing one config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigHealth {
    pub config_id: String,
    pub account_id: String,
    pub name: String,
    pub encryption_type: EncryptionType,
    pub healthy: bool,
    pub error: Option<String>,
}

pub struct EncryptionConfigRegistry {
    store: Arc<dyn SecretStore>,
    backends: Backends,
    settings: SecretsSettings,
    entitlements: Arc<dyn Entitlements>,
}

impl EncryptionConfigRegistry {
    /// The manager limit is taken from `settings.max_secret_managers`.
    pub fn new(store: Arc<dyn SecretStore>, backends: Backends, settings: SecretsSettings) -> Self {
        let entitlements = Arc::new(ManagerLimit(settings.max_secret_managers));
        Self {
            store,
            backends,
            settings,
            entitlements,
        }
    }

    pub fn with_entitlements(mut self, entitlements: Arc<dyn Entitlements>) -> Self {
        self.entitlements = entitlements;
        self
    }

    pub fn settings(&self) -> &SecretsSettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    pub(crate) fn backend(
        &self,
        encryption_type: EncryptionType,
    ) -> Result<Arc<dyn EncryptionBackend>> {
        self.backends.get(encryption_type)
    }

    fn global_account_id(&self) -> &str {
        &self.settings.global_account_id
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Create or update a config and return its id.
    ///
    /// An empty `config.id` creates. On update, secret fields still holding
    /// the mask token keep their stored values.
    pub fn save(&self, account_id: &str, mut config: EncryptionConfig) -> Result<String> {
        config.account_id = account_id.to_string();
        config.name = config.name.trim().to_string();
        if config.name.is_empty() {
            return Err(SecretsError::Validation("secret manager name is empty".into()));
        }
        if config.encryption_type() == EncryptionType::Local {
            return Err(SecretsError::Validation(
                "the local secret manager is built in and cannot be saved".into(),
            ));
        }
        if config.is_default && config.is_read_only() {
            return Err(SecretsError::Validation(
                "a read-only vault cannot be the default secret manager".into(),
            ));
        }

        let previous = match config.id.as_str() {
            "" => None,
            id => Some(
                self.store
                    .get_config(id)?
                    .filter(|c| c.account_id == account_id)
                    .ok_or_else(|| SecretsError::not_found("secret manager", id))?,
            ),
        };

        match &previous {
            None => {
                let existing = self.store.list_configs(account_id)?.len();
                if !self.entitlements.may_add_secret_manager(account_id, existing) {
                    return Err(SecretsError::FeatureUnavailable(format!(
                        "account {account_id} cannot add another secret manager"
                    )));
                }
                config.id = Uuid::new_v4().to_string();
                config.created_at = Utc::now();
            }
            Some(previous) => {
                if previous.encryption_type() != config.encryption_type() {
                    return Err(SecretsError::Validation(format!(
                        "secret manager {} is a {} manager",
                        previous.id,
                        previous.encryption_type()
                    )));
                }
                config.created_at = previous.created_at;
            }
        }

        let stored = previous.clone().map(|p| self.hydrate(p, 0)).transpose()?;
        self.fill_credentials(&mut config, stored.as_ref())?;

        let backend = self.backends.get(config.encryption_type())?;
        backend.validate(&config).map_err(|e| {
            SecretsError::Validation(format!(
                "secret manager {} failed validation: {e}",
                config.name
            ))
        })?;

        self.store_credentials(&mut config, previous.as_ref())?;
        config.num_of_encrypted_value = 0;

        if config.is_default {
            let cleared = self.store.clear_defaults(account_id, &config.id)?;
            debug!(
                account_id,
                kms_id = %config.id,
                cleared,
                "cleared previous default secret manager"
            );
        }
        let id = config.id.clone();
        info!(
            account_id,
            kms_id = %id,
            encryption_type = %config.encryption_type(),
            is_default = config.is_default,
            updated = previous.is_some(),
            "saved secret manager"
        );
        self.store.save_config(config)?;
        Ok(id)
    }

    /// Apply defaults, resolve masked fields against the stored values and
    /// reject what is still missing.
    fn fill_credentials(
        &self,
        config: &mut EncryptionConfig,
        stored: Option<&EncryptionConfig>,
    ) -> Result<()> {
        match &mut config.credentials {
            Credentials::Kms(kms) if kms.region.trim().is_empty() => {
                kms.region = DEFAULT_KMS_REGION.into()
            }
            Credentials::Vault(vault) => {
                if vault.vault_url.trim().is_empty() {
                    return Err(SecretsError::Validation("vault url is empty".into()));
                }
                if vault.base_path.trim().is_empty() {
                    vault.base_path = DEFAULT_VAULT_BASE_PATH.into();
                }
            }
            _ => {}
        }

        let stored_values: HashMap<&'static str, String> = stored
            .map(|s| {
                s.credentials
                    .secret_fields()
                    .into_iter()
                    .map(|(field, value)| (field, value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let mask = self.settings.secret_mask.as_str();

        for (field, value) in config.credentials.secret_fields_mut() {
            if value.as_str() == mask {
                *value = stored_values.get(field).cloned().ok_or_else(|| {
                    SecretsError::Validation(format!("{field} is masked but has no stored value"))
                })?;
            }
            if value.trim().is_empty() {
                return Err(SecretsError::Validation(format!("{field} is missing")));
            }
        }
        Ok(())
    }

    /// Persist each secret field as a credential record and swap the field
    /// value for the record id. Records of a previous version are updated
    /// in place.
    fn store_credentials(
        &self,
        config: &mut EncryptionConfig,
        previous: Option<&EncryptionConfig>,
    ) -> Result<()> {
        let previous_ids: HashMap<&'static str, String> = previous
            .map(|p| {
                p.credentials
                    .secret_fields()
                    .into_iter()
                    .map(|(field, id)| (field, id.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let local = self.backends.get(EncryptionType::Local)?;
        let local_config = EncryptionConfig::local(&config.account_id);
        let account_id = config.account_id.clone();
        let config_id = config.id.clone();
        let config_name = config.name.clone();
        let now = Utc::now();

        for (field, value) in config.credentials.secret_fields_mut() {
            let existing = match previous_ids.get(field) {
                Some(id) => self.store.get_data(id)?,
                None => None,
            };
            let name = format!("{config_name}_{field}");
            let sealed = local.encrypt(
                &EncryptRequest {
                    account_id: &account_id,
                    name: &name,
                    kind: SecretKind::ManagerCredential,
                    plaintext: Some(value.as_bytes()),
                    existing: existing.as_ref(),
                },
                &local_config,
            )?;
            let record = match existing {
                Some(mut record) => {
                    record.name = name;
                    record.encryption_type = EncryptionType::Local;
                    record.kms_id = account_id.clone();
                    record.encrypted_value = sealed.encrypted_value;
                    record.encryption_key = sealed.encryption_key;
                    record.last_updated_at = now;
                    record
                }
                None => EncryptedData {
                    id: Uuid::new_v4().to_string(),
                    account_id: account_id.clone(),
                    name,
                    kind: SecretKind::ManagerCredential,
                    encryption_type: EncryptionType::Local,
                    encrypted_value: sealed.encrypted_value,
                    encryption_key: sealed.encryption_key,
                    kms_id: account_id.clone(),
                    parent_ids: BTreeSet::from([config_id.clone()]),
                    path: None,
                    enabled: true,
                    created_at: now,
                    created_by: None,
                    last_updated_at: now,
                    encrypted_by: None,
                },
            };
            *value = record.id.clone();
            self.store.save_data(record)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The account's default config, else the global default. Credentials
    /// are unmasked.
    pub fn get_default(&self, account_id: &str) -> Result<Option<EncryptionConfig>> {
        let own = self.store.list_configs(account_id)?.into_iter().find(|c| c.is_default);
        let found = match own {
            Some(config) => Some(config),
            None if account_id != self.global_account_id() => self
                .store
                .list_configs(self.global_account_id())?
                .into_iter()
                .find(|c| c.is_default),
            None => None,
        };
        found.map(|config| self.hydrate(config, 0)).transpose()
    }

    /// The config new secrets of the account are encrypted with.
    pub(crate) fn effective_config(&self, account_id: &str) -> Result<EncryptionConfig> {
        Ok(self
            .get_default(account_id)?
            .unwrap_or_else(|| EncryptionConfig::local(account_id)))
    }

    /// Account configs plus global configs, newest first. Without a global
    /// default the built-in local manager is listed last.
    pub fn list(
        &self,
        account_id: &str,
        encryption_type: Option<EncryptionType>,
        unmask: bool,
    ) -> Result<Vec<EncryptionConfig>> {
        let mut configs = self.store.list_configs(account_id)?;
        let account_has_default = configs.iter().any(|c| c.is_default);
        let mut global_default = false;
        if account_id != self.global_account_id() {
            for mut global in self.store.list_configs(self.global_account_id())? {
                global_default |= global.is_default;
                // The account's own default shadows the global one.
                global.is_default &= !account_has_default;
                configs.push(global);
            }
        }
        configs.retain(|c| encryption_type.map_or(true, |t| c.encryption_type() == t));
        configs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut listed = configs
            .into_iter()
            .map(|config| self.present(account_id, config, unmask))
            .collect::<Result<Vec<_>>>()?;
        if !global_default && encryption_type.map_or(true, |t| t == EncryptionType::Local) {
            let mut local = self.get(account_id, account_id, unmask)?;
            local.is_default = !account_has_default;
            listed.push(local);
        }
        Ok(listed)
    }

    /// One config visible to the account. The account id itself names the
    /// built-in local manager.
    pub fn get(&self, account_id: &str, config_id: &str, unmask: bool) -> Result<EncryptionConfig> {
        if config_id == account_id {
            let mut local = EncryptionConfig::local(account_id);
            local.num_of_encrypted_value = self.count_encrypted(account_id, config_id)?;
            return Ok(local);
        }
        let config = self.visible_config(account_id, config_id)?;
        self.present(account_id, config, unmask)
    }

    fn visible_config(&self, account_id: &str, config_id: &str) -> Result<EncryptionConfig> {
        self.store
            .get_config(config_id)?
            .filter(|c| c.account_id == account_id || c.account_id == self.global_account_id())
            .ok_or_else(|| SecretsError::not_found("secret manager", config_id))
    }

    fn present(
        &self,
        account_id: &str,
        mut config: EncryptionConfig,
        unmask: bool,
    ) -> Result<EncryptionConfig> {
        config.num_of_encrypted_value = self.count_encrypted(account_id, &config.id)?;
        if unmask {
            self.hydrate(config, 0)
        } else {
            config.credentials.mask(&self.settings.secret_mask);
            Ok(config)
        }
    }

    fn count_encrypted(&self, account_id: &str, kms_id: &str) -> Result<usize> {
        let filter = DataFilter::account(account_id).kms_id(kms_id);
        self.store.count_data(&filter)
    }

    /// Display name of the config that owns a record.
    pub fn secret_manager_name(
        &self,
        kms_id: &str,
        encryption_type: EncryptionType,
    ) -> Result<String> {
        if encryption_type == EncryptionType::Local {
            return Ok(LOCAL_SECRET_MANAGER_NAME.to_string());
        }
        self.store
            .get_config(kms_id)?
            .map(|c| c.name)
            .ok_or_else(|| SecretsError::not_found("secret manager", kms_id))
    }

    // -----------------------------------------------------------------------
    // Internal unmasked path
    // -----------------------------------------------------------------------

    /// Unmasked config for a config id of the given type, visible to the
    /// account.
    pub(crate) fn config_for(
        &self,
        account_id: &str,
        config_id: &str,
        encryption_type: EncryptionType,
    ) -> Result<EncryptionConfig> {
        let config = if encryption_type == EncryptionType::Local {
            if config_id != account_id {
                return Err(SecretsError::not_found("secret manager", config_id));
            }
            EncryptionConfig::local(account_id)
        } else {
            self.hydrate(self.visible_config(account_id, config_id)?, 0)?
        };
        if config.encryption_type() != encryption_type {
            return Err(SecretsError::Validation(format!(
                "secret manager {config_id} is a {} manager, not {encryption_type}",
                config.encryption_type()
            )));
        }
        Ok(config)
    }

    /// Unmasked config a record was encrypted with. Dispatch is by the
    /// record's own type and owning config, never the current default.
    pub(crate) fn config_for_record(&self, record: &EncryptedData) -> Result<EncryptionConfig> {
        self.record_config(record, 0)
    }

    fn record_config(&self, record: &EncryptedData, depth: usize) -> Result<EncryptionConfig> {
        if record.encryption_type == EncryptionType::Local {
            let mut config = EncryptionConfig::local(&record.account_id);
            config.id = record.kms_id.clone();
            return Ok(config);
        }
        let config = self
            .store
            .get_config(&record.kms_id)?
            .ok_or_else(|| SecretsError::not_found("secret manager", record.kms_id.as_str()))?;
        if config.encryption_type() != record.encryption_type {
            return Err(SecretsError::Decryption {
                record_id: record.id.clone(),
                reason: format!(
                    "record type {} does not match its secret manager",
                    record.encryption_type
                ),
            });
        }
        self.hydrate(config, depth)
    }

    /// Replace credential record ids with their decrypted values.
    fn hydrate(&self, mut config: EncryptionConfig, depth: usize) -> Result<EncryptionConfig> {
        if depth >= MAX_CREDENTIAL_DEPTH {
            return Err(SecretsError::Decryption {
                record_id: config.id.clone(),
                reason: "manager credentials are nested too deeply".into(),
            });
        }
        for (field, value) in config.credentials.secret_fields_mut() {
            let record = self
                .store
                .get_data(value.as_str())?
                .ok_or_else(|| SecretsError::not_found("credential", value.as_str()))?;
            let owner = self.record_config(&record, depth + 1)?;
            let plaintext = self
                .backends
                .get(record.encryption_type)?
                .decrypt(&record, &owner)
                .map_err(|e| SecretsError::Decryption {
                    record_id: record.id.clone(),
                    reason: e.to_string(),
                })?
                .ok_or_else(|| SecretsError::Decryption {
                    record_id: record.id.clone(),
                    reason: format!("{field} is empty"),
                })?;
            *value = String::from_utf8(plaintext).map_err(|_| SecretsError::Decryption {
                record_id: record.id.clone(),
                reason: format!("{field} is not valid UTF-8"),
            })?;
        }
        Ok(config)
    }

    // -----------------------------------------------------------------------
    // Delete and health
    // -----------------------------------------------------------------------

    /// Delete a config no record is encrypted with any more.
    pub fn delete(&self, account_id: &str, config_id: &str) -> Result<()> {
        let config = self
            .store
            .get_config(config_id)?
            .filter(|c| c.account_id == account_id)
            .ok_or_else(|| SecretsError::not_found("secret manager", config_id))?;

        // Global configs encrypt records of every account.
        let in_use = self.store.count_data(&DataFilter::default().kms_id(config_id))?;
        if in_use > 0 {
            return Err(SecretsError::InUse {
                entity: "secret manager",
                id: config_id.to_string(),
                reason: format!(
                    "{in_use} secrets are encrypted by {}; transition them first",
                    config.name
                ),
            });
        }

        let credentials = DataFilter::account(account_id)
            .kind(SecretKind::ManagerCredential)
            .parent(config_id);
        for record in self.store.find_data(&credentials)? {
            self.store.delete_data(&record.id)?;
        }
        self.store.delete_config(config_id)?;
        info!(account_id, kms_id = config_id, name = %config.name, "deleted secret manager");
        Ok(())
    }

    /// Smoke-test every config visible to the account.
    pub fn validate_all(&self, account_id: &str) -> Result<Vec<ConfigHealth>> {
        let mut report = Vec::new();
        for stored in self.list(account_id, None, false)? {
            let outcome = self
                .config_for(account_id, &stored.id, stored.encryption_type())
                .and_then(|config| {
                    self.backends.get(config.encryption_type())?.validate(&config)
                });
            let error = outcome.err().map(|e| e.to_string());
            if let Some(reason) = &error {
                warn!(
                    account_id,
                    kms_id = %stored.id,
                    name = %stored.name,
                    error = %reason,
                    "secret manager is not usable"
                );
            }
            report.push(ConfigHealth {
                config_id: stored.id,
                account_id: stored.account_id,
                name: stored.name,
                encryption_type: stored.credentials.encryption_type(),
                healthy: error.is_none(),
                error,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryKms, InMemoryVault, KmsBackend, VaultBackend};
    use crate::model::{KmsCredentials, VaultCredentials};
    use crate::store::InMemoryStore;

    struct Fixture {
        kms: Arc<InMemoryKms>,
        vault: Arc<InMemoryVault>,
        store: Arc<InMemoryStore>,
        registry: EncryptionConfigRegistry,
    }

    fn fixture(settings: SecretsSettings) -> Fixture {
        let kms = Arc::new(InMemoryKms::new());
        kms.add_principal("AKIA1", "secret1");
        let vault = Arc::new(InMemoryVault::new());
        vault.add_token("s.root");
        let store = Arc::new(InMemoryStore::new());
        let backends = Backends::new()
            .with(Arc::new(KmsBackend::new(Arc::clone(&kms))))
            .with(Arc::new(VaultBackend::new(Arc::clone(&vault))));
        let registry = EncryptionConfigRegistry::new(store.clone(), backends, settings);
        Fixture {
            kms,
            vault,
            store,
            registry,
        }
    }

    fn kms_config(f: &Fixture, account: &str, name: &str) -> EncryptionConfig {
        let arn = f.kms.create_key("us-east-1").unwrap();
        EncryptionConfig::kms(
            account,
            name,
            KmsCredentials {
                access_key: "AKIA1".into(),
                secret_key: "secret1".into(),
                kms_arn: arn,
                region: String::new(),
            },
        )
    }

    fn vault_config(account: &str, name: &str, read_only: bool) -> EncryptionConfig {
        EncryptionConfig::vault(
            account,
            name,
            VaultCredentials {
                vault_url: "https://vault.internal:8200".into(),
                auth_token: "s.root".into(),
                base_path: String::new(),
                read_only,
            },
        )
    }

    #[test]
    fn test_save_stores_credentials_as_records() {
        let f = fixture(SecretsSettings::default());
        let id = f.registry.save("acct", kms_config(&f, "acct", "kms")).unwrap();

        let persisted = f.store.get_config(&id).unwrap().unwrap();
        let Credentials::Kms(creds) = &persisted.credentials else {
            panic!("expected kms credentials");
        };
        assert_ne!(creds.secret_key, "secret1");
        assert_eq!(creds.region, "us-east-1");
        let record = f.store.get_data(&creds.secret_key).unwrap().unwrap();
        assert_eq!(record.kind, SecretKind::ManagerCredential);
        assert!(record.parent_ids.contains(&id));

        let unmasked = f.registry.get("acct", &id, true).unwrap();
        let Credentials::Kms(creds) = unmasked.credentials else {
            panic!("expected kms credentials");
        };
        assert_eq!(creds.secret_key, "secret1");
    }

    #[test]
    fn test_masked_update_keeps_stored_values() {
        let f = fixture(SecretsSettings::default());
        let id = f.registry.save("acct", kms_config(&f, "acct", "kms")).unwrap();

        let mut masked = f.registry.get("acct", &id, false).unwrap();
        masked.name = "renamed".into();
        f.registry.save("acct", masked).unwrap();

        let unmasked = f.registry.get("acct", &id, true).unwrap();
        assert_eq!(unmasked.name, "renamed");
        let Credentials::Kms(creds) = unmasked.credentials else {
            panic!("expected kms credentials");
        };
        assert_eq!(creds.access_key, "AKIA1");
    }

    #[test]
    fn test_mask_on_create_is_rejected() {
        let f = fixture(SecretsSettings::default());
        let mut config = kms_config(&f, "acct", "kms");
        config.credentials.mask(crate::config::DEFAULT_SECRET_MASK);
        let err = f.registry.save("acct", config).unwrap_err();
        assert!(matches!(err, SecretsError::Validation(_)));
    }

    #[test]
    fn test_failed_round_trip_is_validation() {
        let f = fixture(SecretsSettings::default());
        let mut config = vault_config("acct", "vault", false);
        if let Credentials::Vault(v) = &mut config.credentials {
            v.auth_token = "s.wrong".into();
        }
        let err = f.registry.save("acct", config).unwrap_err();
        assert!(matches!(err, SecretsError::Validation(_)));
        assert!(f.store.list_configs("acct").unwrap().is_empty());
        assert!(f.vault.is_empty());
    }

    #[test]
    fn test_read_only_vault_cannot_be_default() {
        let f = fixture(SecretsSettings::default());
        let config = vault_config("acct", "ro", true).with_default(true);
        assert!(matches!(
            f.registry.save("acct", config),
            Err(SecretsError::Validation(_))
        ));
    }

    #[test]
    fn test_only_one_default_per_account() {
        let f = fixture(SecretsSettings::default());
        let first = f
            .registry
            .save("acct", kms_config(&f, "acct", "one").with_default(true))
            .unwrap();
        let second = f
            .registry
            .save("acct", kms_config(&f, "acct", "two").with_default(true))
            .unwrap();

        let defaults: Vec<_> = f
            .registry
            .list("acct", None, false)
            .unwrap()
            .into_iter()
            .filter(|c| c.is_default)
            .map(|c| c.id)
            .collect();
        assert_eq!(defaults, vec![second.clone()]);
        assert_ne!(first, second);
        assert_eq!(f.registry.get_default("acct").unwrap().unwrap().id, second);
    }

    #[test]
    fn test_global_default_is_fallback_and_shadowed() {
        let f = fixture(SecretsSettings::default());
        let global = crate::config::DEFAULT_GLOBAL_ACCOUNT_ID;
        let global_id = f
            .registry
            .save(global, kms_config(&f, global, "global").with_default(true))
            .unwrap();
        assert_eq!(f.registry.get_default("acct").unwrap().unwrap().id, global_id);

        let own = f
            .registry
            .save("acct", kms_config(&f, "acct", "own").with_default(true))
            .unwrap();
        let listed = f.registry.list("acct", None, false).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|c| c.id == global_id && !c.is_default));
        assert!(listed.iter().any(|c| c.id == own && c.is_default));
    }

    #[test]
    fn test_entitlement_limits_new_managers_only() {
        let f = fixture(SecretsSettings {
            max_secret_managers: Some(1),
            ..SecretsSettings::default()
        });
        let id = f.registry.save("acct", kms_config(&f, "acct", "one")).unwrap();
        let err = f.registry.save("acct", kms_config(&f, "acct", "two")).unwrap_err();
        assert!(matches!(err, SecretsError::FeatureUnavailable(_)));

        let mut update = f.registry.get("acct", &id, false).unwrap();
        update.is_default = true;
        f.registry.save("acct", update).unwrap();
    }

    #[test]
    fn test_delete_removes_credential_records() {
        let f = fixture(SecretsSettings::default());
        let id = f.registry.save("acct", vault_config("acct", "vault", false)).unwrap();
        assert_eq!(f.store.count_data(&DataFilter::account("acct").parent(&id)).unwrap(), 1);

        f.registry.delete("acct", &id).unwrap();
        assert!(f.store.get_config(&id).unwrap().is_none());
        assert_eq!(f.store.count_data(&DataFilter::account("acct")).unwrap(), 0);
        assert!(matches!(
            f.registry.delete("acct", &id),
            Err(SecretsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_validate_all_reports_broken_manager() {
        let f = fixture(SecretsSettings::default());
        let config = kms_config(&f, "acct", "kms");
        let arn = match &config.credentials {
            Credentials::Kms(k) => k.kms_arn.clone(),
            _ => unreachable!(),
        };
        f.registry.save("acct", config).unwrap();
        f.registry.save("acct", vault_config("acct", "vault", false)).unwrap();
        f.kms.schedule_key_deletion(&arn);

        let report = f.registry.validate_all("acct").unwrap();
        assert_eq!(report.len(), 3);
        let broken: Vec<_> = report
            .iter()
            .filter(|h| !h.healthy)
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(broken, vec!["kms"]);
    }

    #[test]
    fn test_local_manager_name() {
        let f = fixture(SecretsSettings::default());
        assert_eq!(
            f.registry.secret_manager_name("acct", EncryptionType::Local).unwrap(),
            LOCAL_SECRET_MANAGER_NAME
        );
        assert_eq!(f.registry.get("acct", "acct", false).unwrap().name, LOCAL_SECRET_MANAGER_NAME);
    }

    #[test]
    fn test_list_shows_local_manager_without_global_default() {
        let f = fixture(SecretsSettings::default());
        let listed = f.registry.list("acct", None, false).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "acct");
        assert!(listed[0].is_default);

        let kms = f
            .registry
            .save("acct", kms_config(&f, "acct", "kms").with_default(true))
            .unwrap();
        let listed = f.registry.list("acct", None, false).unwrap();
        let ids: Vec<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![kms.as_str(), "acct"]);
        // The three KMS credentials are local records.
        assert_eq!(listed[1].num_of_encrypted_value, 3);
        assert!(!listed[1].is_default);
        assert_eq!(f.registry.list("acct", Some(EncryptionType::Kms), false).unwrap().len(), 1);

        let global = crate::config::DEFAULT_GLOBAL_ACCOUNT_ID;
        f.registry
            .save(global, kms_config(&f, global, "global").with_default(true))
            .unwrap();
        let listed = f.registry.list("acct", None, false).unwrap();
        assert!(listed.iter().all(|c| c.encryption_type() != EncryptionType::Local));
    }
}
