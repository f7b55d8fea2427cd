//! Secret lifecycle facade.
//!
//! Business entities never touch ciphertext: they hand plaintext (or a
//! mask, or a reference token) to [`SecretManager::encrypt_at_save`] and
//! keep the returned record id. One record may be held by several owners;
//! it is removed when the last owner lets go, unless it is a standalone
//! secret or file.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditTrail, SecretChangeLog, SecretUsageLog};
use crate::backend::EncryptRequest;
use crate::error::{Result, SecretsError};
use crate::model::{
    Actor, EncryptedData, EncryptionConfig, EncryptionType, OwnerRef, Page, PageRequest, SecretKind,
    SecretRef, Sealed, UsageContext,
};
use crate::registry::EncryptionConfigRegistry;
use crate::store::{DataFilter, SecretStore};

const CREATED: &str = "Created";
const CHANGED_PASSWORD: &str = "Changed password";
const CHANGED_NAME: &str = "Changed name";
const CHANGED_VALUE: &str = "Changed value";
const CHANGED_NAME_AND_VALUE: &str = "Changed name & value";
const FILE_UPLOADED: &str = "File uploaded";
const CHANGED_FILE: &str = "Changed File";
const CHANGED_NAME_AND_FILE: &str = "Changed Name and File";

/// What an owner supplies for an encrypted field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretValue {
    /// New plaintext. `None` or empty stores a configured-but-empty secret.
    Plain(Option<Vec<u8>>),
    /// The mask token came back unchanged; keep the stored ciphertext.
    Unchanged,
    /// Reuse an existing record by its reference token.
    Reference(String),
}

impl SecretValue {
    /// Interpret a raw form value: the mask token means unchanged.
    pub fn from_input(input: Option<&str>, mask: &str) -> Self {
        match input {
            Some(value) if value == mask => Self::Unchanged,
            Some(value) => Self::Plain(Some(value.as_bytes().to_vec())),
            None => Self::Plain(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub account_id: String,
    pub owner: OwnerRef,
    /// Display name of the record.
    pub name: String,
    pub value: SecretValue,
    /// Record the owner held before this save, if any.
    pub existing_record_id: Option<String>,
}

pub struct SecretManager {
    registry: Arc<EncryptionConfigRegistry>,
    audit: Arc<AuditTrail>,
}

impl SecretManager {
    pub fn new(registry: Arc<EncryptionConfigRegistry>, audit: Arc<AuditTrail>) -> Self {
        Self { registry, audit }
    }

    pub fn registry(&self) -> &Arc<EncryptionConfigRegistry> {
        &self.registry
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    fn store(&self) -> &Arc<dyn SecretStore> {
        self.registry.store()
    }

    fn load(&self, account_id: &str, record_id: &str) -> Result<EncryptedData> {
        self.store()
            .get_data(record_id)?
            .filter(|r| r.account_id == account_id)
            .ok_or_else(|| SecretsError::not_found("secret", record_id))
    }

    /// Encrypt under the account's effective config.
    fn seal(
        &self,
        account_id: &str,
        name: &str,
        kind: SecretKind,
        plaintext: Option<&[u8]>,
        existing: Option<&EncryptedData>,
    ) -> Result<(EncryptionConfig, Sealed)> {
        let config = self.registry.effective_config(account_id)?;
        let backend = self.registry.backend(config.encryption_type())?;
        let sealed = backend.encrypt(
            &EncryptRequest {
                account_id,
                name,
                kind,
                plaintext,
                existing,
            },
            &config,
        )?;
        Ok((config, sealed))
    }

    /// Drop whatever a backend keeps outside the record. Failures are
    /// logged; the record itself is already gone or rewritten.
    fn remove_artifact(&self, record: &EncryptedData) {
        let outcome = self.registry.config_for_record(record).and_then(|config| {
            self.registry
                .backend(record.encryption_type)?
                .remove(record, &config)
        });
        if let Err(e) = outcome {
            warn!(
                record_id = %record.id,
                kms_id = %record.kms_id,
                error = %e,
                "failed to remove backend artifact"
            );
        }
    }

    fn new_record(
        &self,
        actor: &Actor,
        account_id: &str,
        name: &str,
        kind: SecretKind,
        parent_ids: BTreeSet<String>,
        plaintext: Option<&[u8]>,
    ) -> Result<EncryptedData> {
        let (config, sealed) = self.seal(account_id, name, kind, plaintext, None)?;
        let now = Utc::now();
        let record = EncryptedData {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            kind,
            encryption_type: config.encryption_type(),
            encrypted_value: sealed.encrypted_value,
            encryption_key: sealed.encryption_key,
            kms_id: config.id,
            parent_ids,
            path: None,
            enabled: true,
            created_at: now,
            created_by: Some(actor.clone()),
            last_updated_at: now,
            encrypted_by: None,
        };
        self.store().save_data(record.clone())?;
        Ok(record)
    }

    /// Re-encrypt a record in place under the account's effective config.
    fn reseal(&self, record: &mut EncryptedData, plaintext: Option<&[u8]>) -> Result<()> {
        let previous = record.clone();
        let (config, sealed) = self.seal(
            &record.account_id,
            &record.name,
            record.kind,
            plaintext,
            Some(&previous),
        )?;
        record.encryption_type = config.encryption_type();
        record.kms_id = config.id;
        record.encrypted_value = sealed.encrypted_value;
        record.encryption_key = sealed.encryption_key;
        record.path = None;
        record.last_updated_at = Utc::now();
        self.store().save_data(record.clone())?;

        let moved = previous.kms_id != record.kms_id
            || previous.encryption_type != record.encryption_type;
        if moved || previous.encryption_key != record.encryption_key {
            self.remove_artifact(&previous);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Owner-held secrets
    // -----------------------------------------------------------------------

    /// Persist an owner's encrypted field and return the record id to keep.
    pub fn encrypt_at_save(&self, actor: &Actor, request: SaveRequest) -> Result<String> {
        let SaveRequest {
            account_id,
            owner,
            name,
            value,
            existing_record_id,
        } = request;
        let existing = existing_record_id
            .as_deref()
            .map(|id| self.load(&account_id, id))
            .transpose()?;

        match value {
            SecretValue::Reference(token) => {
                let reference: SecretRef = token.parse()?;
                let mut target = self.load(&account_id, &reference.record_id)?;
                if target.encryption_type != reference.encryption_type {
                    return Err(SecretsError::Validation(format!(
                        "secret {} is not managed by {}",
                        target.id,
                        reference.encryption_type.yaml_name()
                    )));
                }
                if let Some(existing) = existing.filter(|e| e.id != target.id) {
                    self.release(&account_id, &existing.id, &owner.id)?;
                }
                target.parent_ids.insert(owner.id.clone());
                let id = target.id.clone();
                self.store().save_data(target)?;
                debug!(
                    account_id = %account_id,
                    record_id = %id,
                    owner_id = %owner.id,
                    "owner reuses secret"
                );
                Ok(id)
            }
            SecretValue::Unchanged => {
                let mut record = existing.ok_or_else(|| {
                    SecretsError::Validation(format!(
                        "{name}: masked value given for a secret that does not exist"
                    ))
                })?;
                record.parent_ids.insert(owner.id.clone());
                if record.name != name {
                    record.name = name;
                    record.last_updated_at = Utc::now();
                }
                let id = record.id.clone();
                self.store().save_data(record)?;
                Ok(id)
            }
            SecretValue::Plain(plaintext) => {
                let plaintext = plaintext.filter(|p| !p.is_empty());
                match existing {
                    // Standalone secrets only change through their own
                    // update calls; an owner typing a new value forks.
                    Some(mut record)
                        if !record.kind.is_standalone()
                            && record.parent_ids.iter().all(|p| p == &owner.id) =>
                    {
                        record.name = name;
                        record.parent_ids.insert(owner.id.clone());
                        self.reseal(&mut record, plaintext.as_deref())?;
                        self.audit
                            .record_change(&account_id, &record.id, actor, CHANGED_PASSWORD);
                        info!(
                            account_id = %account_id,
                            record_id = %record.id,
                            kms_id = %record.kms_id,
                            "re-encrypted secret"
                        );
                        Ok(record.id)
                    }
                    shared => {
                        if let Some(shared) = shared {
                            self.release(&account_id, &shared.id, &owner.id)?;
                        }
                        let record = self.new_record(
                            actor,
                            &account_id,
                            &name,
                            owner.kind,
                            BTreeSet::from([owner.id.clone()]),
                            plaintext.as_deref(),
                        )?;
                        self.audit.record_change(&account_id, &record.id, actor, CREATED);
                        info!(
                            account_id = %account_id,
                            record_id = %record.id,
                            kms_id = %record.kms_id,
                            "created secret"
                        );
                        Ok(record.id)
                    }
                }
            }
        }
    }

    /// Decrypt a record under the config it was encrypted with and log the
    /// access.
    pub fn decrypt_on_read(
        &self,
        record_id: &str,
        context: &UsageContext,
    ) -> Result<Option<Vec<u8>>> {
        let record = self
            .store()
            .get_data(record_id)?
            .ok_or_else(|| SecretsError::not_found("secret", record_id))?;
        let config = self.registry.config_for_record(&record)?;
        let backend = self.registry.backend(record.encryption_type)?;
        self.audit.record_usage(&record.account_id, &record.id, context);
        backend.decrypt(&record, &config).map_err(|e| match e {
            SecretsError::Operation { .. } => e,
            other => SecretsError::Decryption {
                record_id: record.id.clone(),
                reason: other.to_string(),
            },
        })
    }

    /// Remove an owner from a record. Returns `true` when this deleted the
    /// record.
    pub fn release(&self, account_id: &str, record_id: &str, owner_id: &str) -> Result<bool> {
        let mut record = self.load(account_id, record_id)?;
        record.parent_ids.remove(owner_id);
        if record.parent_ids.is_empty() && !record.kind.is_standalone() {
            self.store().delete_data(&record.id)?;
            self.remove_artifact(&record);
            debug!(account_id, record_id, "deleted secret without owners");
            return Ok(true);
        }
        self.store().save_data(record)?;
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Standalone secrets
    // -----------------------------------------------------------------------

    fn check_name(
        &self,
        account_id: &str,
        kind: SecretKind,
        name: &str,
        except: Option<&str>,
    ) -> Result<()> {
        if name.trim().is_empty() {
            return Err(SecretsError::Validation("secret name is empty".into()));
        }
        let taken = self
            .store()
            .find_data(&DataFilter::account(account_id).kind(kind))?
            .into_iter()
            .any(|r| r.name == name && Some(r.id.as_str()) != except);
        if taken {
            return Err(SecretsError::Validation(format!("a secret named {name} already exists")));
        }
        Ok(())
    }

    fn load_standalone(
        &self,
        account_id: &str,
        record_id: &str,
        kind: SecretKind,
    ) -> Result<EncryptedData> {
        let record = self.load(account_id, record_id)?;
        if record.kind != kind {
            return Err(SecretsError::not_found(
                if kind == SecretKind::ConfigFile { "file" } else { "secret" },
                record_id,
            ));
        }
        Ok(record)
    }

    fn delete_standalone(&self, account_id: &str, record_id: &str, kind: SecretKind) -> Result<()> {
        let record = self.load_standalone(account_id, record_id, kind)?;
        if !record.parent_ids.is_empty() {
            return Err(SecretsError::InUse {
                entity: if kind == SecretKind::ConfigFile { "file" } else { "secret" },
                id: record.id.clone(),
                reason: format!("referenced by {} entities", record.parent_ids.len()),
            });
        }
        self.store().delete_data(&record.id)?;
        self.remove_artifact(&record);
        info!(account_id, record_id, "deleted {}", record.name);
        Ok(())
    }

    /// Create a free-standing secret that owners reference by token.
    pub fn save_secret(
        &self,
        actor: &Actor,
        account_id: &str,
        name: &str,
        value: Option<&[u8]>,
    ) -> Result<String> {
        self.check_name(account_id, SecretKind::SecretText, name, None)?;
        let value = value.filter(|v| !v.is_empty());
        let record = self.new_record(
            actor,
            account_id,
            name,
            SecretKind::SecretText,
            BTreeSet::new(),
            value,
        )?;
        self.audit.record_change(account_id, &record.id, actor, CREATED);
        info!(
            account_id,
            record_id = %record.id,
            kms_id = %record.kms_id,
            "created standalone secret"
        );
        Ok(record.id)
    }

    /// Create a standalone secret that points at an existing path in a
    /// secret engine instead of holding a value. The path must be readable
    /// with the engine's credentials; the secret is never written or
    /// removed there.
    pub fn save_vault_reference(
        &self,
        actor: &Actor,
        account_id: &str,
        name: &str,
        vault_config_id: &str,
        path: &str,
    ) -> Result<String> {
        self.check_name(account_id, SecretKind::SecretText, name, None)?;
        let path = path.trim().trim_start_matches('/');
        if path.is_empty() {
            return Err(SecretsError::Validation("secret path is empty".into()));
        }
        let config = self
            .registry
            .config_for(account_id, vault_config_id, EncryptionType::Vault)?;

        let now = Utc::now();
        let record = EncryptedData {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            name: name.to_string(),
            kind: SecretKind::SecretText,
            encryption_type: EncryptionType::Vault,
            encrypted_value: None,
            encryption_key: String::new(),
            kms_id: config.id.clone(),
            parent_ids: BTreeSet::new(),
            path: Some(path.to_string()),
            enabled: true,
            created_at: now,
            created_by: Some(actor.clone()),
            last_updated_at: now,
            encrypted_by: None,
        };
        self.registry
            .backend(EncryptionType::Vault)?
            .decrypt(&record, &config)
            .map_err(|e| SecretsError::Validation(format!("cannot read secret at {path}: {e}")))?;

        self.store().save_data(record.clone())?;
        self.audit.record_change(account_id, &record.id, actor, CREATED);
        info!(
            account_id,
            record_id = %record.id,
            kms_id = %config.id,
            path,
            "created path reference"
        );
        Ok(record.id)
    }

    /// Rename and/or change the value of a standalone secret. Returns
    /// whether anything changed.
    pub fn update_secret(
        &self,
        actor: &Actor,
        account_id: &str,
        record_id: &str,
        name: &str,
        value: SecretValue,
    ) -> Result<bool> {
        let mut record = self.load_standalone(account_id, record_id, SecretKind::SecretText)?;
        let renamed = record.name != name;
        if renamed {
            self.check_name(account_id, SecretKind::SecretText, name, Some(record_id))?;
            record.name = name.to_string();
        }
        let new_value = match value {
            SecretValue::Unchanged => None,
            SecretValue::Plain(plain) => Some(plain.filter(|p| !p.is_empty())),
            SecretValue::Reference(_) => {
                return Err(SecretsError::Validation(
                    "a standalone secret cannot reference another secret".into(),
                ))
            }
        };

        let description = match (renamed, new_value.is_some()) {
            (true, true) => CHANGED_NAME_AND_VALUE,
            (true, false) => CHANGED_NAME,
            (false, true) => CHANGED_VALUE,
            (false, false) => return Ok(false),
        };
        match new_value {
            Some(plaintext) => self.reseal(&mut record, plaintext.as_deref())?,
            None => {
                record.last_updated_at = Utc::now();
                self.store().save_data(record)?;
            }
        }
        self.audit.record_change(account_id, record_id, actor, description);
        info!(account_id, record_id, change = description, "updated standalone secret");
        Ok(true)
    }

    pub fn delete_secret(&self, account_id: &str, record_id: &str) -> Result<()> {
        self.delete_standalone(account_id, record_id, SecretKind::SecretText)
    }

    /// Records of one kind, newest first, with ciphertext masked and the
    /// owning manager's name filled in.
    pub fn list_secrets(&self, account_id: &str, kind: SecretKind) -> Result<Vec<EncryptedData>> {
        let mask = self.registry.settings().secret_mask.as_bytes().to_vec();
        let mut records = self.store().find_data(&DataFilter::account(account_id).kind(kind))?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for record in &mut records {
            record.encrypted_value = Some(mask.clone());
            record.encryption_key = String::new();
            record.encrypted_by = self
                .registry
                .secret_manager_name(&record.kms_id, record.encryption_type)
                .ok();
        }
        Ok(records)
    }

    /// Owners currently referencing a record.
    pub fn secret_usage(&self, account_id: &str, record_id: &str) -> Result<BTreeSet<String>> {
        Ok(self.load(account_id, record_id)?.parent_ids)
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    fn check_size(&self, content: &[u8]) -> Result<()> {
        let max = self.registry.settings().max_file_size_bytes;
        if content.len() > max {
            return Err(SecretsError::Validation(format!(
                "file is {} bytes, the limit is {max}",
                content.len()
            )));
        }
        Ok(())
    }

    pub fn save_file(
        &self,
        actor: &Actor,
        account_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<String> {
        self.check_size(content)?;
        self.check_name(account_id, SecretKind::ConfigFile, name, None)?;
        let record = self.new_record(
            actor,
            account_id,
            name,
            SecretKind::ConfigFile,
            BTreeSet::new(),
            Some(content),
        )?;
        self.audit.record_change(account_id, &record.id, actor, FILE_UPLOADED);
        info!(account_id, record_id = %record.id, size = content.len(), "uploaded file");
        Ok(record.id)
    }

    /// Rename a file and/or replace its content. `None` keeps the content.
    pub fn update_file(
        &self,
        actor: &Actor,
        account_id: &str,
        record_id: &str,
        name: &str,
        content: Option<&[u8]>,
    ) -> Result<bool> {
        if let Some(content) = content {
            self.check_size(content)?;
        }
        let mut record = self.load_standalone(account_id, record_id, SecretKind::ConfigFile)?;
        let renamed = record.name != name;
        if renamed {
            self.check_name(account_id, SecretKind::ConfigFile, name, Some(record_id))?;
            record.name = name.to_string();
        }
        let description = match (renamed, content.is_some()) {
            (true, true) => CHANGED_NAME_AND_FILE,
            (false, true) => CHANGED_FILE,
            (true, false) => CHANGED_NAME,
            (false, false) => return Ok(false),
        };
        match content {
            Some(content) => self.reseal(&mut record, Some(content))?,
            None => {
                record.last_updated_at = Utc::now();
                self.store().save_data(record)?;
            }
        }
        self.audit.record_change(account_id, record_id, actor, description);
        Ok(true)
    }

    pub fn get_file(
        &self,
        account_id: &str,
        record_id: &str,
        context: &UsageContext,
    ) -> Result<Vec<u8>> {
        self.load_standalone(account_id, record_id, SecretKind::ConfigFile)?;
        Ok(self.decrypt_on_read(record_id, context)?.unwrap_or_default())
    }

    pub fn delete_file(&self, account_id: &str, record_id: &str) -> Result<()> {
        self.delete_standalone(account_id, record_id, SecretKind::ConfigFile)
    }

    // -----------------------------------------------------------------------
    // References and logs
    // -----------------------------------------------------------------------

    /// Token other owners can save instead of plaintext.
    pub fn secret_reference(&self, account_id: &str, record_id: &str) -> Result<SecretRef> {
        let record = self.load(account_id, record_id)?;
        Ok(SecretRef {
            encryption_type: record.encryption_type,
            record_id: record.id,
        })
    }

    pub fn resolve_reference(&self, account_id: &str, token: &str) -> Result<EncryptedData> {
        let reference: SecretRef = token.parse()?;
        let record = self.load(account_id, &reference.record_id)?;
        if record.encryption_type != reference.encryption_type {
            return Err(SecretsError::not_found("secret", token));
        }
        Ok(record)
    }

    fn owner_records(
        &self,
        account_id: &str,
        owner_id: &str,
        owner_kind: SecretKind,
    ) -> Result<Vec<String>> {
        if owner_kind.is_standalone() {
            return Ok(vec![owner_id.to_string()]);
        }
        Ok(self
            .store()
            .find_data(&DataFilter::account(account_id).parent(owner_id))?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    /// Change history of an owner's secrets, newest first. For standalone
    /// kinds the owner id is the record id.
    pub fn get_change_logs(
        &self,
        account_id: &str,
        owner_id: &str,
        owner_kind: SecretKind,
    ) -> Result<Vec<SecretChangeLog>> {
        let ids = self.owner_records(account_id, owner_id, owner_kind)?;
        Ok(self.audit.change_logs(account_id, &ids))
    }

    pub fn get_usage_logs(
        &self,
        account_id: &str,
        owner_id: &str,
        owner_kind: SecretKind,
        page: PageRequest,
    ) -> Result<Page<SecretUsageLog>> {
        let ids = self.owner_records(account_id, owner_id, owner_kind)?;
        Ok(self.audit.usage_logs(account_id, &ids, page))
    }
}
