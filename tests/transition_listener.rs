//! Background listener and durable queue replay across restarts.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{harness_with, ACCOUNT};
use secretkeeper::backend::KmsBackend;
use secretkeeper::{
    Backends, EncryptionType, FileTransitionQueue, SecretStore, SecretsCore, SecretsSettings,
    TransitionQueue, TransitionState,
};

fn fast_settings() -> SecretsSettings {
    SecretsSettings {
        transition_poll_interval_ms: 10,
        ..SecretsSettings::default()
    }
}

fn wait_for_complete(core: &SecretsCore, job: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if core.transitions().job(job).map(|j| j.state) == Some(TransitionState::Complete) {
            return;
        }
        assert!(Instant::now() < deadline, "transition {job} did not complete");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_pending_event_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("transitions.jsonl");

    let h = harness_with(fast_settings(), Arc::new(FileTransitionQueue::open(&journal).unwrap()));
    let k1 = h.core.registry().save(ACCOUNT, h.kms_config(ACCOUNT, "k1")).unwrap();
    let ids: Vec<String> = (0..3).map(|i| h.save(&format!("svc-{i}"), "v")).collect();
    let job = h
        .core
        .transitions()
        .enqueue(ACCOUNT, ACCOUNT, EncryptionType::Local, &k1, EncryptionType::Kms)
        .unwrap();
    // The process goes away before the listener ever ran.
    let store = h.store.clone();
    let kms = Arc::clone(&h.kms);
    drop(h);

    let queue = Arc::new(FileTransitionQueue::open(&journal).unwrap());
    assert_eq!(queue.pending().unwrap().len(), 1);
    let restarted = SecretsCore::new(
        store.clone(),
        Backends::new().with(Arc::new(KmsBackend::new(kms))),
        fast_settings(),
        queue.clone(),
    )
    .unwrap();

    let listener = restarted.start_listener().unwrap();
    wait_for_complete(&restarted, &job);
    listener.stop();

    assert!(queue.pending().unwrap().is_empty());
    for id in &ids {
        assert_eq!(store.get_data(id).unwrap().unwrap().kms_id, k1);
    }
    assert_eq!(FileTransitionQueue::open(&journal).unwrap().pending().unwrap().len(), 0);
}

#[test]
fn test_listener_handles_events_enqueued_while_running() {
    let h = harness_with(fast_settings(), Arc::new(secretkeeper::InMemoryTransitionQueue::new()));
    let k1 = h.core.registry().save(ACCOUNT, h.kms_config(ACCOUNT, "k1")).unwrap();
    let k2 = h.core.registry().save(ACCOUNT, h.kms_config(ACCOUNT, "k2")).unwrap();
    let id = h.save("svc-a", "moving");

    let listener = h.core.start_listener().unwrap();
    let first = h
        .core
        .transitions()
        .enqueue(ACCOUNT, ACCOUNT, EncryptionType::Local, &k1, EncryptionType::Kms)
        .unwrap();
    wait_for_complete(&h.core, &first);
    let second = h
        .core
        .transitions()
        .enqueue(ACCOUNT, &k1, EncryptionType::Kms, &k2, EncryptionType::Kms)
        .unwrap();
    wait_for_complete(&h.core, &second);
    drop(listener);

    assert_eq!(h.store.get_data(&id).unwrap().unwrap().kms_id, k2);
    assert_eq!(h.read(&id).as_deref(), Some("moving"));
    h.core.registry().delete(ACCOUNT, &k1).unwrap();
}
