//! Live migration of secrets between configs.
//!
//! A transition is requested with [`TransitionCoordinator::enqueue`] and
//! carried out later by [`TransitionCoordinator::run_once`], usually driven
//! by a [`TransitionListener`] thread. Each record is re-encrypted in place:
//! its id, owners and change history stay the same, only the ciphertext and
//! the owning config change.
//!
//! A job that fails part way stays `InProgress` and its event stays queued;
//! the next cycle rescans and picks up what is left. Records already moved
//! are no longer matched by the scan, so replay is idempotent.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::EncryptRequest;
use crate::error::{Result, SecretsError};
use crate::model::{EncryptedData, EncryptionConfig, EncryptionType, SecretKind};
use crate::queue::{TransitionEvent, TransitionQueue};
use crate::registry::EncryptionConfigRegistry;
use crate::store::DataFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionState {
    Enqueued,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionJob {
    pub event: TransitionEvent,
    pub state: TransitionState,
    pub migrated: usize,
    pub skipped: usize,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl TransitionJob {
    fn new(event: TransitionEvent) -> Self {
        Self {
            event,
            state: TransitionState::Enqueued,
            migrated: 0,
            skipped: 0,
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PassOutcome {
    migrated: usize,
    skipped: usize,
}

pub struct TransitionCoordinator {
    registry: Arc<EncryptionConfigRegistry>,
    queue: Arc<dyn TransitionQueue>,
    jobs: RwLock<HashMap<String, TransitionJob>>,
}

impl TransitionCoordinator {
    pub fn new(registry: Arc<EncryptionConfigRegistry>, queue: Arc<dyn TransitionQueue>) -> Self {
        Self {
            registry,
            queue,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Queue a transition of every record of `from` to `to` and return the
    /// event id. Nothing is re-encrypted here.
    pub fn enqueue(
        &self,
        account_id: &str,
        from_config_id: &str,
        from_type: EncryptionType,
        to_config_id: &str,
        to_type: EncryptionType,
    ) -> Result<String> {
        if from_config_id == to_config_id {
            return Err(SecretsError::Validation(
                "source and target secret manager are the same".into(),
            ));
        }
        self.registry.config_for(account_id, from_config_id, from_type)?;
        let target = self.registry.config_for(account_id, to_config_id, to_type)?;
        if target.is_read_only() {
            return Err(SecretsError::Validation(format!(
                "cannot transition secrets into read-only vault {}",
                target.name
            )));
        }

        let event = TransitionEvent {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            from_config_id: from_config_id.to_string(),
            from_type,
            to_config_id: to_config_id.to_string(),
            to_type,
            enqueued_at: Utc::now(),
        };
        let id = event.id.clone();
        // Track the job first: a running listener may pick the event up as
        // soon as it is pushed.
        self.jobs.write().insert(id.clone(), TransitionJob::new(event.clone()));
        if let Err(e) = self.queue.push(event) {
            self.jobs.write().remove(&id);
            return Err(e);
        }
        info!(
            account_id,
            job_id = %id,
            from = from_config_id,
            from_type = %from_type,
            to = to_config_id,
            to_type = %to_type,
            "enqueued secret manager transition"
        );
        Ok(id)
    }

    pub fn job(&self, event_id: &str) -> Option<TransitionJob> {
        self.jobs.read().get(event_id).cloned()
    }

    pub fn jobs(&self) -> Vec<TransitionJob> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.event.enqueued_at.cmp(&b.event.enqueued_at));
        jobs
    }

    /// Process every queued event once. Returns how many jobs completed.
    pub fn run_once(&self) -> Result<usize> {
        let mut completed = 0;
        for event in self.queue.pending()? {
            {
                let mut jobs = self.jobs.write();
                let job = jobs
                    .entry(event.id.clone())
                    .or_insert_with(|| TransitionJob::new(event.clone()));
                job.state = TransitionState::InProgress;
                job.attempts += 1;
            }

            // Saves that raced the first pass may still have landed on the
            // source config; one more pass picks them up.
            let outcome = self.migrate(&event).and_then(|first| {
                let rescan = self.migrate(&event)?;
                Ok(PassOutcome {
                    migrated: first.migrated + rescan.migrated,
                    skipped: first.skipped.max(rescan.skipped),
                })
            });

            match outcome {
                Ok(outcome) => {
                    self.queue.ack(&event.id)?;
                    if let Some(job) = self.jobs.write().get_mut(&event.id) {
                        job.state = TransitionState::Complete;
                        job.migrated += outcome.migrated;
                        job.skipped = outcome.skipped;
                        job.last_error = None;
                    }
                    completed += 1;
                    info!(
                        account_id = %event.account_id,
                        job_id = %event.id,
                        migrated = outcome.migrated,
                        skipped = outcome.skipped,
                        "transition complete"
                    );
                }
                Err(e) => {
                    if let Some(job) = self.jobs.write().get_mut(&event.id) {
                        job.last_error = Some(e.to_string());
                    }
                    error!(
                        account_id = %event.account_id,
                        job_id = %event.id,
                        error = %e,
                        "transition failed; will retry"
                    );
                }
            }
        }
        Ok(completed)
    }

    /// One scan over the records still owned by the source config.
    fn migrate(&self, event: &TransitionEvent) -> Result<PassOutcome> {
        let from = self
            .registry
            .config_for(&event.account_id, &event.from_config_id, event.from_type)?;
        let to = self
            .registry
            .config_for(&event.account_id, &event.to_config_id, event.to_type)?;
        let store = self.registry.store();
        let filter = DataFilter::account(&event.account_id)
            .kms_id(&event.from_config_id)
            .encryption_type(event.from_type);

        let mut outcome = PassOutcome::default();
        for candidate in store.find_data(&filter)? {
            if let Some(reason) = skip_reason(&candidate, &to) {
                debug!(record_id = %candidate.id, job_id = %event.id, reason, "skipping record");
                outcome.skipped += 1;
                continue;
            }
            // Re-read: a concurrent save may have moved or deleted it.
            let Some(current) = store.get_data(&candidate.id)? else {
                continue;
            };
            if current.kms_id != event.from_config_id
                || current.encryption_type != event.from_type
            {
                debug!(record_id = %current.id, job_id = %event.id, "record moved concurrently");
                continue;
            }
            self.move_record(current, &from, &to)?;
            outcome.migrated += 1;
        }
        Ok(outcome)
    }

    fn move_record(
        &self,
        record: EncryptedData,
        from: &EncryptionConfig,
        to: &EncryptionConfig,
    ) -> Result<()> {
        let source = self.registry.backend(from.encryption_type())?;
        let target = self.registry.backend(to.encryption_type())?;

        let plaintext = source.decrypt(&record, from).map_err(|e| match e {
            SecretsError::Operation { .. } => e,
            other => SecretsError::Decryption {
                record_id: record.id.clone(),
                reason: other.to_string(),
            },
        })?;
        let sealed = target.encrypt(
            &EncryptRequest {
                account_id: &record.account_id,
                name: &record.name,
                kind: record.kind,
                plaintext: plaintext.as_deref(),
                existing: Some(&record),
            },
            to,
        )?;

        let mut moved = record.clone();
        moved.encryption_type = to.encryption_type();
        moved.kms_id = to.id.clone();
        moved.encrypted_value = sealed.encrypted_value;
        moved.encryption_key = sealed.encryption_key;
        moved.path = None;
        moved.last_updated_at = Utc::now();
        self.registry.store().save_data(moved)?;

        if let Err(e) = source.remove(&record, from) {
            warn!(
                record_id = %record.id,
                kms_id = %from.id,
                error = %e,
                "failed to remove source artifact"
            );
        }
        Ok(())
    }
}

/// Records a transition must leave where they are.
fn skip_reason(record: &EncryptedData, to: &EncryptionConfig) -> Option<&'static str> {
    if record.kms_id == to.id && record.encryption_type == to.encryption_type() {
        return Some("already on target");
    }
    if record.is_path_reference() {
        return Some("path reference");
    }
    // Credentials share the local manager's id with ordinary local records.
    // Moving them would let managers encrypt each other's credentials.
    if record.kind == SecretKind::ManagerCredential {
        return Some("manager credential stays local");
    }
    None
}

// ---------------------------------------------------------------------------
// Background listener
// ---------------------------------------------------------------------------

/// Drives [`TransitionCoordinator::run_once`] on a background thread.
pub struct TransitionListener;

impl TransitionListener {
    pub fn spawn(
        coordinator: Arc<TransitionCoordinator>,
        poll_interval: Duration,
    ) -> Result<ListenerHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("secretkeeper-transition".into())
            .spawn(move || {
                info!(poll_ms = (poll_interval.as_millis() as u64), "transition listener started");
                loop {
                    if let Err(e) = coordinator.run_once() {
                        error!(error = %e, "transition cycle failed");
                    }
                    match stop_rx.recv_timeout(poll_interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("transition listener stopped");
            })?;
        Ok(ListenerHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Stops the listener when dropped.
pub struct ListenerHandle {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Signal the worker and wait for the current cycle to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("transition listener panicked");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::audit::AuditTrail;
    use crate::backend::{Backends, InMemoryKms, KmsBackend};
    use crate::config::SecretsSettings;
    use crate::manager::{SaveRequest, SecretManager, SecretValue};
    use crate::model::{Actor, KmsCredentials, OwnerRef, UsageContext};
    use crate::queue::InMemoryTransitionQueue;
    use crate::store::{InMemoryStore, SecretStore};

    struct Fixture {
        kms: Arc<InMemoryKms>,
        store: Arc<InMemoryStore>,
        manager: SecretManager,
        coordinator: TransitionCoordinator,
    }

    fn fixture() -> Fixture {
        let kms = Arc::new(InMemoryKms::new());
        kms.add_principal("AKIA1", "secret1");
        let store = Arc::new(InMemoryStore::new());
        let backends = Backends::new().with(Arc::new(KmsBackend::new(Arc::clone(&kms))));
        let registry = Arc::new(EncryptionConfigRegistry::new(
            store.clone(),
            backends,
            SecretsSettings::default(),
        ));
        let coordinator = TransitionCoordinator::new(
            Arc::clone(&registry),
            Arc::new(InMemoryTransitionQueue::new()),
        );
        let manager = SecretManager::new(registry, Arc::new(AuditTrail::new()));
        Fixture {
            kms,
            store,
            manager,
            coordinator,
        }
    }

    fn kms_config(f: &Fixture, name: &str, default: bool) -> String {
        let arn = f.kms.create_key("us-east-1").unwrap();
        let config = EncryptionConfig::kms(
            "acct",
            name,
            KmsCredentials {
                access_key: "AKIA1".into(),
                secret_key: "secret1".into(),
                kms_arn: arn,
                region: "us-east-1".into(),
            },
        )
        .with_default(default);
        f.manager.registry().save("acct", config).unwrap()
    }

    fn save(f: &Fixture, owner: &str, value: &str) -> String {
        f.manager
            .encrypt_at_save(
                &Actor::system(),
                SaveRequest {
                    account_id: "acct".into(),
                    owner: OwnerRef::new(owner, SecretKind::SettingField),
                    name: owner.into(),
                    value: SecretValue::Plain(Some(value.as_bytes().to_vec())),
                    existing_record_id: None,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_enqueue_rejects_same_and_unknown() {
        let f = fixture();
        let k1 = kms_config(&f, "k1", true);
        assert!(matches!(
            f.coordinator.enqueue("acct", &k1, EncryptionType::Kms, &k1, EncryptionType::Kms),
            Err(SecretsError::Validation(_))
        ));
        assert!(matches!(
            f.coordinator.enqueue("acct", &k1, EncryptionType::Kms, "nope", EncryptionType::Kms),
            Err(SecretsError::NotFound { .. })
        ));
        assert!(matches!(
            f.coordinator
                .enqueue("acct", &k1, EncryptionType::Vault, "acct", EncryptionType::Local),
            Err(SecretsError::Validation(_))
        ));
    }

    #[test]
    fn test_local_to_kms_keeps_ids_and_values() {
        let f = fixture();
        let r1 = save(&f, "s1", "alpha");
        let r2 = save(&f, "s2", "beta");
        let k1 = kms_config(&f, "k1", false);

        let job = f
            .coordinator
            .enqueue("acct", "acct", EncryptionType::Local, &k1, EncryptionType::Kms)
            .unwrap();
        assert_eq!(f.coordinator.job(&job).unwrap().state, TransitionState::Enqueued);
        assert_eq!(f.coordinator.run_once().unwrap(), 1);

        let job = f.coordinator.job(&job).unwrap();
        assert_eq!(job.state, TransitionState::Complete);
        assert_eq!(job.migrated, 2);
        // The KMS config's own credentials stay local.
        assert_eq!(job.skipped, 3);

        for (id, expected) in [(&r1, "alpha"), (&r2, "beta")] {
            let record = f.store.get_data(id).unwrap().unwrap();
            assert_eq!(record.kms_id, k1);
            assert_eq!(record.encryption_type, EncryptionType::Kms);
            let plain = f.manager.decrypt_on_read(id, &UsageContext::default()).unwrap();
            assert_eq!(plain.as_deref(), Some(expected.as_bytes()));
        }
    }

    #[test]
    fn test_failed_job_stays_in_progress_and_replays() {
        let f = fixture();
        let k1 = kms_config(&f, "k1", true);
        let r1 = save(&f, "s1", "alpha");
        let k2 = kms_config(&f, "k2", false);

        f.kms.add_principal("AKIA1", "rotated");
        let job = f
            .coordinator
            .enqueue("acct", &k1, EncryptionType::Kms, &k2, EncryptionType::Kms)
            .unwrap();
        assert_eq!(f.coordinator.run_once().unwrap(), 0);
        let state = f.coordinator.job(&job).unwrap();
        assert_eq!(state.state, TransitionState::InProgress);
        assert!(state.last_error.is_some());

        f.kms.add_principal("AKIA1", "secret1");
        assert_eq!(f.coordinator.run_once().unwrap(), 1);
        let state = f.coordinator.job(&job).unwrap();
        assert_eq!(state.state, TransitionState::Complete);
        assert_eq!(state.attempts, 2);
        assert_eq!(f.store.get_data(&r1).unwrap().unwrap().kms_id, k2);
    }

    #[test]
    fn test_skip_reasons() {
        let f = fixture();
        let k1 = kms_config(&f, "k1", false);
        let to = f.manager.registry().config_for("acct", &k1, EncryptionType::Kms).unwrap();
        let now = Utc::now();
        let mut record = EncryptedData {
            id: "r".into(),
            account_id: "acct".into(),
            name: "r".into(),
            kind: SecretKind::SettingField,
            encryption_type: EncryptionType::Local,
            encrypted_value: None,
            encryption_key: "acct".into(),
            kms_id: "acct".into(),
            parent_ids: BTreeSet::from(["p".to_string()]),
            path: None,
            enabled: true,
            created_at: now,
            created_by: None,
            last_updated_at: now,
            encrypted_by: None,
        };
        assert_eq!(skip_reason(&record, &to), None);
        record.path = Some("external/db".into());
        assert_eq!(skip_reason(&record, &to), Some("path reference"));
        record.path = None;
        // Credentials of other managers stay local as well.
        record.kind = SecretKind::ManagerCredential;
        assert_eq!(skip_reason(&record, &to), Some("manager credential stays local"));
    }

    #[test]
    fn test_listener_drains_queue_and_stops() {
        let f = fixture();
        let r1 = save(&f, "s1", "alpha");
        let k1 = kms_config(&f, "k1", false);
        let Fixture {
            store, coordinator, ..
        } = f;
        let coordinator = Arc::new(coordinator);
        let job = coordinator
            .enqueue("acct", "acct", EncryptionType::Local, &k1, EncryptionType::Kms)
            .unwrap();

        let handle =
            TransitionListener::spawn(Arc::clone(&coordinator), Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while coordinator.job(&job).map(|j| j.state) != Some(TransitionState::Complete) {
            assert!(std::time::Instant::now() < deadline, "listener did not complete the job");
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();
        assert_eq!(store.get_data(&r1).unwrap().unwrap().kms_id, k1);
    }
}
