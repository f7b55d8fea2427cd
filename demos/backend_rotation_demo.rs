//! Minimal example: moving an account's secrets from the local manager to a
//! KMS and then to a second KMS key.
//!
//! Run with: `cargo run --example backend_rotation_demo`
//! Set `RUST_LOG=secretkeeper=debug` for per-record logging.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use secretkeeper::backend::{InMemoryKms, KmsBackend};
use secretkeeper::model::KmsCredentials;
use secretkeeper::{
    Actor, Backends, EncryptionConfig, EncryptionType, FileAuditSink, OwnerRef, SaveRequest,
    SecretKind, SecretValue, SecretsCore, TransitionState, UsageContext,
};
use tracing_subscriber::EnvFilter;

const ACCOUNT: &str = "tenant-a";

fn kms_config(
    kms: &InMemoryKms,
    name: &str,
) -> Result<EncryptionConfig, Box<dyn std::error::Error>> {
    Ok(EncryptionConfig::kms(
        ACCOUNT,
        name,
        KmsCredentials {
            access_key: "AKIADEMO".into(),
            secret_key: "demo-secret".into(),
            kms_arn: kms.create_key("eu-west-1")?,
            region: "eu-west-1".into(),
        },
    ))
}

fn wait(core: &SecretsCore, job: &str) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while core.transitions().job(job).map(|j| j.state) != Some(TransitionState::Complete) {
        if Instant::now() > deadline {
            return Err(format!("transition {job} did not finish").into());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // 1. Setup
    let kms = Arc::new(InMemoryKms::new());
    kms.add_principal("AKIADEMO", "demo-secret");
    let backends = Backends::new().with(Arc::new(KmsBackend::new(Arc::clone(&kms))));
    let core = SecretsCore::in_memory(backends)?;

    let audit_path = PathBuf::from(std::env::temp_dir()).join("secretkeeper_audit.jsonl");
    core.audit().add_forward_sink(Box::new(FileAuditSink::new(&audit_path)?));
    let listener = core.start_listener()?;

    // 2. Secrets saved before any manager exists use the local manager
    let actor = Actor::new("ops-1", "Ops", "ops@example.com");
    let mut records = Vec::new();
    for service in ["billing", "search", "mailer"] {
        let id = core.manager().encrypt_at_save(
            &actor,
            SaveRequest {
                account_id: ACCOUNT.into(),
                owner: OwnerRef::new(service, SecretKind::SettingField),
                name: format!("{service} db password"),
                value: SecretValue::Plain(Some(format!("{service}-pw").into_bytes())),
                existing_record_id: None,
            },
        )?;
        records.push(id);
    }
    println!("Saved {} secrets with the local manager", records.len());

    // 3. Move them to a KMS key
    let primary = core.registry().save(ACCOUNT, kms_config(&kms, "primary")?.with_default(true))?;
    let job = core
        .transitions()
        .enqueue(ACCOUNT, ACCOUNT, EncryptionType::Local, &primary, EncryptionType::Kms)?;
    wait(&core, &job)?;
    println!("Moved secrets to KMS config {primary}");

    // 4. Rotate to a second key and retire the first
    let secondary = core
        .registry()
        .save(ACCOUNT, kms_config(&kms, "secondary")?.with_default(true))?;
    let job = core
        .transitions()
        .enqueue(ACCOUNT, &primary, EncryptionType::Kms, &secondary, EncryptionType::Kms)?;
    wait(&core, &job)?;
    core.registry().delete(ACCOUNT, &primary)?;
    println!("Rotated to KMS config {secondary} and deleted {primary}");

    // 5. Values are unchanged
    let context = UsageContext::workflow("wf-demo", "app-demo", "env-demo");
    for id in &records {
        let value = core.manager().decrypt_on_read(id, &context)?.unwrap_or_default();
        println!("  {id} -> {}", String::from_utf8_lossy(&value));
    }

    listener.stop();
    println!("Audit log written to {}", audit_path.display());
    Ok(())
}
