//! Persistence seam.
//!
//! The document store holding configs and encrypted records lives outside
//! the core; it is reached only through [`SecretStore`]. [`InMemoryStore`]
//! is suitable for tests and single-process deployments.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::model::{EncryptedData, EncryptionConfig, EncryptionType, SecretKind};

/// Field filter over `encrypted_data`. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFilter {
    pub account_id: Option<String>,
    pub kms_id: Option<String>,
    pub encryption_type: Option<EncryptionType>,
    pub kind: Option<SecretKind>,
    pub parent_id: Option<String>,
}

impl DataFilter {
    pub fn account(account_id: &str) -> Self {
        Self {
            account_id: Some(account_id.to_string()),
            ..Self::default()
        }
    }

    pub fn kms_id(mut self, kms_id: &str) -> Self {
        self.kms_id = Some(kms_id.to_string());
        self
    }

    pub fn encryption_type(mut self, encryption_type: EncryptionType) -> Self {
        self.encryption_type = Some(encryption_type);
        self
    }

    pub fn kind(mut self, kind: SecretKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn matches(&self, data: &EncryptedData) -> bool {
        self.account_id.as_ref().map_or(true, |a| &data.account_id == a)
            && self.kms_id.as_ref().map_or(true, |k| &data.kms_id == k)
            && self.encryption_type.map_or(true, |t| data.encryption_type == t)
            && self.kind.map_or(true, |k| data.kind == k)
            && self
                .parent_id
                .as_ref()
                .map_or(true, |p| data.parent_ids.contains(p))
    }
}

/// Keyed, filterable storage for configs and encrypted records.
pub trait SecretStore: Send + Sync {
    /// Insert or replace a config by id.
    fn save_config(&self, config: EncryptionConfig) -> Result<()>;

    fn get_config(&self, id: &str) -> Result<Option<EncryptionConfig>>;

    /// All configs owned by an account, in no particular order.
    fn list_configs(&self, account_id: &str) -> Result<Vec<EncryptionConfig>>;

    /// Clear `is_default` on every config of the account except `keep_id`.
    fn clear_defaults(&self, account_id: &str, keep_id: &str) -> Result<usize>;

    fn delete_config(&self, id: &str) -> Result<bool>;

    /// Insert or replace a record by id.
    fn save_data(&self, data: EncryptedData) -> Result<()>;

    fn get_data(&self, id: &str) -> Result<Option<EncryptedData>>;

    fn find_data(&self, filter: &DataFilter) -> Result<Vec<EncryptedData>>;

    fn count_data(&self, filter: &DataFilter) -> Result<usize>;

    fn delete_data(&self, id: &str) -> Result<bool>;
}

/// In-memory implementation of [`SecretStore`].
#[derive(Default)]
pub struct InMemoryStore {
    configs: RwLock<HashMap<String, EncryptionConfig>>,
    data: RwLock<HashMap<String, EncryptedData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for InMemoryStore {
    fn save_config(&self, config: EncryptionConfig) -> Result<()> {
        self.configs.write().insert(config.id.clone(), config);
        Ok(())
    }

    fn get_config(&self, id: &str) -> Result<Option<EncryptionConfig>> {
        Ok(self.configs.read().get(id).cloned())
    }

    fn list_configs(&self, account_id: &str) -> Result<Vec<EncryptionConfig>> {
        Ok(self
            .configs
            .read()
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect())
    }

    fn clear_defaults(&self, account_id: &str, keep_id: &str) -> Result<usize> {
        let mut configs = self.configs.write();
        let mut cleared = 0;
        for config in configs.values_mut() {
            if config.account_id == account_id && config.id != keep_id && config.is_default {
                config.is_default = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    fn delete_config(&self, id: &str) -> Result<bool> {
        Ok(self.configs.write().remove(id).is_some())
    }

    fn save_data(&self, data: EncryptedData) -> Result<()> {
        self.data.write().insert(data.id.clone(), data);
        Ok(())
    }

    fn get_data(&self, id: &str) -> Result<Option<EncryptedData>> {
        Ok(self.data.read().get(id).cloned())
    }

    fn find_data(&self, filter: &DataFilter) -> Result<Vec<EncryptedData>> {
        Ok(self
            .data
            .read()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    fn count_data(&self, filter: &DataFilter) -> Result<usize> {
        Ok(self.data.read().values().filter(|d| filter.matches(d)).count())
    }

    fn delete_data(&self, id: &str) -> Result<bool> {
        Ok(self.data.write().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Utc;

    use super::*;

    fn record(id: &str, kms_id: &str, parent: &str) -> EncryptedData {
        EncryptedData {
            id: id.into(),
            account_id: "acct".into(),
            name: id.into(),
            kind: SecretKind::SettingField,
            encryption_type: EncryptionType::Kms,
            encrypted_value: None,
            encryption_key: String::new(),
            kms_id: kms_id.into(),
            parent_ids: BTreeSet::from([parent.to_string()]),
            path: None,
            enabled: true,
            created_at: Utc::now(),
            created_by: None,
            last_updated_at: Utc::now(),
            encrypted_by: None,
        }
    }

    #[test]
    fn test_filter_by_kms_and_parent() {
        let store = InMemoryStore::new();
        store.save_data(record("r1", "k1", "p1")).unwrap();
        store.save_data(record("r2", "k1", "p2")).unwrap();
        store.save_data(record("r3", "k2", "p1")).unwrap();

        let filter = DataFilter::account("acct").kms_id("k1");
        assert_eq!(store.count_data(&filter).unwrap(), 2);

        let filter = DataFilter::account("acct").parent("p1");
        let mut ids: Vec<_> = store
            .find_data(&filter)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["r1", "r3"]);
    }

    #[test]
    fn test_clear_defaults_keeps_one() {
        let store = InMemoryStore::new();
        for id in ["a", "b"] {
            let mut config = EncryptionConfig::local("acct");
            config.id = id.into();
            config.is_default = true;
            store.save_config(config).unwrap();
        }
        assert_eq!(store.clear_defaults("acct", "b").unwrap(), 1);
        assert!(!store.get_config("a").unwrap().unwrap().is_default);
        assert!(store.get_config("b").unwrap().unwrap().is_default);
    }
}
