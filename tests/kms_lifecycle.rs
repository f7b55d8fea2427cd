//! End-to-end lifecycle on the envelope-encryption backend: save, share,
//! rotate to a second key, delete the old manager.

mod common;

use common::{harness, ACCOUNT};
use secretkeeper::store::DataFilter;
use secretkeeper::{
    EncryptionType, SecretKind, SecretStore, SecretValue, SecretsError, TransitionState,
};

#[test]
fn test_rotation_between_kms_keys_with_five_owners() {
    let h = harness();
    let registry = h.core.registry();
    let k1 = registry
        .save(ACCOUNT, h.kms_config(ACCOUNT, "primary").with_default(true))
        .unwrap();

    let owners = ["svc-a", "svc-b", "svc-c", "svc-d", "svc-e"];
    let records: Vec<(String, String)> = owners
        .iter()
        .map(|owner| {
            let value = format!("{owner}-s3cret");
            (h.save(owner, &value), value)
        })
        .collect();
    assert_eq!(registry.get(ACCOUNT, &k1, false).unwrap().num_of_encrypted_value, 5);

    let k2 = registry.save(ACCOUNT, h.kms_config(ACCOUNT, "secondary")).unwrap();
    assert!(matches!(
        registry.delete(ACCOUNT, &k1),
        Err(SecretsError::InUse { .. })
    ));

    let job = h
        .core
        .transitions()
        .enqueue(ACCOUNT, &k1, EncryptionType::Kms, &k2, EncryptionType::Kms)
        .unwrap();
    assert_eq!(h.core.transitions().run_once().unwrap(), 1);
    let job = h.core.transitions().job(&job).unwrap();
    assert_eq!(job.state, TransitionState::Complete);
    assert_eq!(job.migrated, 5);

    for (id, value) in &records {
        let record = h.store.get_data(id).unwrap().unwrap();
        assert_eq!(record.kms_id, k2);
        assert_eq!(h.read(id).as_deref(), Some(value.as_str()));
    }
    assert_eq!(registry.get(ACCOUNT, &k1, false).unwrap().num_of_encrypted_value, 0);
    assert_eq!(registry.get(ACCOUNT, &k2, false).unwrap().num_of_encrypted_value, 5);

    // Transitions do not write change logs.
    for owner in owners {
        let logs = h
            .core
            .manager()
            .get_change_logs(ACCOUNT, owner, SecretKind::SettingField)
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].description, "Created");
    }

    registry.delete(ACCOUNT, &k1).unwrap();
    assert_eq!(registry.list(ACCOUNT, Some(EncryptionType::Kms), false).unwrap().len(), 1);
}

#[test]
fn test_records_keep_decrypting_after_default_changes() {
    let h = harness();
    let registry = h.core.registry();
    let local_record = h.save("svc-a", "before-kms");

    let k1 = registry
        .save(ACCOUNT, h.kms_config(ACCOUNT, "primary").with_default(true))
        .unwrap();
    let kms_record = h.save("svc-b", "after-kms");

    assert_eq!(
        h.store.get_data(&local_record).unwrap().unwrap().encryption_type,
        EncryptionType::Local
    );
    assert_eq!(h.store.get_data(&kms_record).unwrap().unwrap().kms_id, k1);
    assert_eq!(h.read(&local_record).as_deref(), Some("before-kms"));
    assert_eq!(h.read(&kms_record).as_deref(), Some("after-kms"));
}

#[test]
fn test_shared_record_survives_until_last_owner_leaves() {
    let h = harness();
    h.core
        .registry()
        .save(ACCOUNT, h.kms_config(ACCOUNT, "primary").with_default(true))
        .unwrap();
    let manager = h.core.manager();

    let id = h.save("svc-a", "shared");
    let token = manager.secret_reference(ACCOUNT, &id).unwrap().to_string();
    assert!(token.starts_with("amazonkms:"));
    for owner in ["svc-b", "svc-c"] {
        assert_eq!(h.save_with(owner, SecretValue::Reference(token.clone()), None), id);
    }
    assert_eq!(manager.secret_usage(ACCOUNT, &id).unwrap().len(), 3);
    let settings = DataFilter::account(ACCOUNT).kind(SecretKind::SettingField);
    assert_eq!(h.store.count_data(&settings).unwrap(), 1);

    assert!(!manager.release(ACCOUNT, &id, "svc-a").unwrap());
    assert!(!manager.release(ACCOUNT, &id, "svc-b").unwrap());
    assert_eq!(h.read(&id).as_deref(), Some("shared"));
    assert!(manager.release(ACCOUNT, &id, "svc-c").unwrap());
    assert!(h.store.get_data(&id).unwrap().is_none());
}

#[test]
fn test_revoked_kms_key_fails_reads_with_kms_tag() {
    let h = harness();
    let config = h.kms_config(ACCOUNT, "primary").with_default(true);
    let arn = match &config.credentials {
        secretkeeper::model::Credentials::Kms(kms) => kms.kms_arn.clone(),
        _ => unreachable!(),
    };
    h.core.registry().save(ACCOUNT, config).unwrap();
    let id = h.save("svc-a", "value");

    h.kms.schedule_key_deletion(&arn);
    let err = h
        .core
        .manager()
        .decrypt_on_read(&id, &Default::default())
        .unwrap_err();
    assert!(matches!(err, SecretsError::Operation { backend: EncryptionType::Kms, .. }));
    assert!(err.is_retryable());
}
