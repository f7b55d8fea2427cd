//! # secretkeeper
//!
//! Multi-tenant secrets management with pluggable encryption backends.
//!
//! Sensitive values are stored encrypted at rest. The cryptographic work is
//! delegated to a backend chosen per account: a local key, a remote
//! envelope-encryption service, or a remote secret engine. Records are
//! shared by reference between owners, every change and read is audited,
//! and all secrets of one backend config can be moved to another while the
//! system stays live.
//!
//! ## Public API
//!
//! [`SecretsCore`] wires the pieces together. The building blocks
//! ([`EncryptionConfigRegistry`], [`SecretManager`],
//! [`TransitionCoordinator`]) can also be assembled by hand.

pub(crate) mod crypto;
pub(crate) mod keys;

pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod queue;
pub mod registry;
pub mod store;
pub mod transition;

use std::sync::Arc;

pub use audit::{AuditSink, AuditTrail, FileAuditSink};
pub use backend::{Backends, EncryptionBackend};
pub use config::SecretsSettings;
pub use error::{Result, SecretsError};
pub use keys::KeyMaterial;
pub use manager::{SaveRequest, SecretManager, SecretValue};
pub use model::{
    Actor, EncryptedData, EncryptionConfig, EncryptionType, OwnerRef, SecretKind, SecretRef,
    UsageContext,
};
pub use queue::{FileTransitionQueue, InMemoryTransitionQueue, TransitionQueue};
pub use registry::{ConfigHealth, EncryptionConfigRegistry};
pub use store::{InMemoryStore, SecretStore};
pub use transition::{ListenerHandle, TransitionCoordinator, TransitionListener, TransitionState};

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Registry, manager and transition coordinator sharing one store, one
/// audit trail and one set of backends.
pub struct SecretsCore {
    registry: Arc<EncryptionConfigRegistry>,
    manager: SecretManager,
    coordinator: Arc<TransitionCoordinator>,
}

impl SecretsCore {
    pub fn new(
        store: Arc<dyn SecretStore>,
        backends: Backends,
        settings: SecretsSettings,
        queue: Arc<dyn TransitionQueue>,
    ) -> Result<Self> {
        settings.validate()?;
        let registry = Arc::new(EncryptionConfigRegistry::new(store, backends, settings));
        let manager = SecretManager::new(Arc::clone(&registry), Arc::new(AuditTrail::new()));
        let coordinator = Arc::new(TransitionCoordinator::new(Arc::clone(&registry), queue));
        Ok(Self {
            registry,
            manager,
            coordinator,
        })
    }

    /// In-memory store and queue with default settings.
    pub fn in_memory(backends: Backends) -> Result<Self> {
        Self::new(
            Arc::new(InMemoryStore::new()),
            backends,
            SecretsSettings::default(),
            Arc::new(InMemoryTransitionQueue::new()),
        )
    }

    pub fn registry(&self) -> &EncryptionConfigRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &SecretManager {
        &self.manager
    }

    pub fn audit(&self) -> &AuditTrail {
        self.manager.audit()
    }

    pub fn transitions(&self) -> &Arc<TransitionCoordinator> {
        &self.coordinator
    }

    /// Start the background transition worker at the configured poll
    /// interval.
    pub fn start_listener(&self) -> Result<ListenerHandle> {
        TransitionListener::spawn(
            Arc::clone(&self.coordinator),
            self.registry.settings().transition_poll_interval(),
        )
    }
}
