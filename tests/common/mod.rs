//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use secretkeeper::backend::{InMemoryKms, InMemoryVault, KmsBackend, VaultBackend, VaultClient};
use secretkeeper::model::{KmsCredentials, VaultCredentials};
use secretkeeper::{
    Actor, Backends, EncryptionConfig, InMemoryStore, InMemoryTransitionQueue, OwnerRef,
    SaveRequest, SecretKind, SecretValue, SecretsCore, SecretsSettings, TransitionQueue,
};

pub const ACCOUNT: &str = "acct-1";
pub const ACCESS_KEY: &str = "AKIAEXAMPLE";
pub const SECRET_KEY: &str = "wJalrXUtnFEMI";
pub const VAULT_TOKEN: &str = "s.root-token";

pub struct Harness {
    pub kms: Arc<InMemoryKms>,
    pub vault: Arc<InMemoryVault>,
    pub store: Arc<InMemoryStore>,
    pub core: SecretsCore,
}

pub fn harness() -> Harness {
    harness_with(SecretsSettings::default(), Arc::new(InMemoryTransitionQueue::new()))
}

pub fn harness_with(settings: SecretsSettings, queue: Arc<dyn TransitionQueue>) -> Harness {
    let kms = Arc::new(InMemoryKms::new());
    kms.add_principal(ACCESS_KEY, SECRET_KEY);
    let vault = Arc::new(InMemoryVault::new());
    vault.add_token(VAULT_TOKEN);
    let store = Arc::new(InMemoryStore::new());
    let backends = Backends::new()
        .with(Arc::new(KmsBackend::new(Arc::clone(&kms))))
        .with(Arc::new(VaultBackend::new(Arc::clone(&vault))));
    let core = SecretsCore::new(store.clone(), backends, settings, queue).unwrap();
    Harness {
        kms,
        vault,
        store,
        core,
    }
}

pub fn actor() -> Actor {
    Actor::new("user-1", "Ada", "ada@example.com")
}

impl Harness {
    pub fn kms_config(&self, account: &str, name: &str) -> EncryptionConfig {
        let arn = self.kms.create_key("us-east-1").unwrap();
        EncryptionConfig::kms(
            account,
            name,
            KmsCredentials {
                access_key: ACCESS_KEY.into(),
                secret_key: SECRET_KEY.into(),
                kms_arn: arn,
                region: "us-east-1".into(),
            },
        )
    }

    pub fn vault_config(&self, account: &str, name: &str) -> EncryptionConfig {
        EncryptionConfig::vault(
            account,
            name,
            VaultCredentials {
                vault_url: "https://vault.internal:8200".into(),
                auth_token: VAULT_TOKEN.into(),
                base_path: "secrets".into(),
                read_only: false,
            },
        )
    }

    /// Write a secret straight into the engine, as an operator would.
    pub fn external_vault_secret(&self, path: &str, value: &str) {
        let credentials = VaultCredentials {
            vault_url: "https://vault.internal:8200".into(),
            auth_token: VAULT_TOKEN.into(),
            base_path: "secrets".into(),
            read_only: false,
        };
        self.vault.write(&credentials, path, &STANDARD.encode(value)).unwrap();
    }

    /// Save a setting-field secret for `owner` and return its record id.
    pub fn save(&self, owner: &str, value: &str) -> String {
        self.save_with(owner, SecretValue::Plain(Some(value.as_bytes().to_vec())), None)
    }

    pub fn save_with(&self, owner: &str, value: SecretValue, existing: Option<String>) -> String {
        self.core
            .manager()
            .encrypt_at_save(
                &actor(),
                SaveRequest {
                    account_id: ACCOUNT.into(),
                    owner: OwnerRef::new(owner, SecretKind::SettingField),
                    name: format!("{owner}-password"),
                    value,
                    existing_record_id: existing,
                },
            )
            .unwrap()
    }

    pub fn read(&self, record_id: &str) -> Option<String> {
        self.core
            .manager()
            .decrypt_on_read(record_id, &Default::default())
            .unwrap()
            .map(|bytes| String::from_utf8(bytes).unwrap())
    }
}
