//! Immutable audit logging.
//!
//! Records who changed a secret (change log) and every decrypt access
//! (usage log). Both logs are append-only: entries are never mutated or
//! removed, even after the secret itself is deleted. Entries can be
//! forwarded to pluggable sinks (files, external stores).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Actor, Page, PageRequest, UsageContext};

/// A sink that receives audit entries. Implement this to forward entries
/// to a file, database, or other persistent store.
pub trait AuditSink: Send {
    /// Called once for every appended entry.
    fn append(&mut self, entry: AuditEntry);
}

/// Who modified a secret and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretChangeLog {
    pub id: String,
    pub encrypted_data_id: String,
    pub account_id: String,
    pub actor: Actor,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// One decrypt access and the context it happened in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretUsageLog {
    pub id: String,
    pub encrypted_data_id: String,
    pub account_id: String,
    pub workflow_execution_id: Option<String>,
    pub app_id: Option<String>,
    pub env_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What forward sinks receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "log", rename_all = "snake_case")]
pub enum AuditEntry {
    Change(SecretChangeLog),
    Usage(SecretUsageLog),
}

/// Append-only change and usage logs.
#[derive(Default)]
pub struct AuditTrail {
    changes: RwLock<Vec<SecretChangeLog>>,
    usages: RwLock<Vec<SecretUsageLog>>,
    forward_sinks: Mutex<Vec<Box<dyn AuditSink>>>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("changes", &self.changes.read().len())
            .field("usages", &self.usages.read().len())
            .field("forward_sinks", &self.forward_sinks.lock().len())
            .finish()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every entry.
    pub fn add_forward_sink(&self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.lock().push(sink);
    }

    fn forward(&self, entry: AuditEntry) {
        for sink in self.forward_sinks.lock().iter_mut() {
            sink.append(entry.clone());
        }
    }

    /// Append a change entry for a record.
    pub fn record_change(
        &self,
        account_id: &str,
        encrypted_data_id: &str,
        actor: &Actor,
        description: &str,
    ) -> SecretChangeLog {
        let log = SecretChangeLog {
            id: Uuid::new_v4().to_string(),
            encrypted_data_id: encrypted_data_id.to_string(),
            account_id: account_id.to_string(),
            actor: actor.clone(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        self.changes.write().push(log.clone());
        self.forward(AuditEntry::Change(log.clone()));
        log
    }

    /// Append a usage entry for a decrypt access.
    pub fn record_usage(
        &self,
        account_id: &str,
        encrypted_data_id: &str,
        context: &UsageContext,
    ) -> SecretUsageLog {
        let log = SecretUsageLog {
            id: Uuid::new_v4().to_string(),
            encrypted_data_id: encrypted_data_id.to_string(),
            account_id: account_id.to_string(),
            workflow_execution_id: context.workflow_execution_id.clone(),
            app_id: context.app_id.clone(),
            env_id: context.env_id.clone(),
            created_at: Utc::now(),
        };
        self.usages.write().push(log.clone());
        self.forward(AuditEntry::Usage(log.clone()));
        log
    }

    /// Change entries for the given records, newest first.
    pub fn change_logs(&self, account_id: &str, record_ids: &[String]) -> Vec<SecretChangeLog> {
        self.changes
            .read()
            .iter()
            .rev()
            .filter(|log| {
                log.account_id == account_id && record_ids.contains(&log.encrypted_data_id)
            })
            .cloned()
            .collect()
    }

    /// Usage entries for the given records, newest first, one page at a time.
    pub fn usage_logs(
        &self,
        account_id: &str,
        record_ids: &[String],
        page: PageRequest,
    ) -> Page<SecretUsageLog> {
        let usages = self.usages.read();
        let matching: Vec<&SecretUsageLog> = usages
            .iter()
            .rev()
            .filter(|log| {
                log.account_id == account_id && record_ids.contains(&log.encrypted_data_id)
            })
            .collect();
        Page {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(page.offset)
                .take(page.limit)
                .cloned()
                .collect(),
        }
    }

    pub fn change_count(&self) -> usize {
        self.changes.read().len()
    }

    pub fn usage_count(&self) -> usize {
        self.usages.read().len()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit entries as JSON lines to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, entry: AuditEntry) {
        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(e) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
                    tracing::error!(error = %e, "failed to write audit entry");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize audit entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_logs_newest_first() {
        let trail = AuditTrail::new();
        let actor = Actor::new("u1", "User", "u1@example.com");
        trail.record_change("acct", "r1", &actor, "Created");
        trail.record_change("acct", "r1", &actor, "Changed password");
        trail.record_change("acct", "r2", &actor, "Created");

        let logs = trail.change_logs("acct", &["r1".to_string()]);
        let descriptions: Vec<_> = logs.iter().map(|l| l.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Changed password", "Created"]);
    }

    #[test]
    fn test_usage_logs_paginate() {
        let trail = AuditTrail::new();
        for i in 0..5 {
            let ctx = UsageContext::workflow(format!("wf-{i}"), "app", "env");
            trail.record_usage("acct", "r1", &ctx);
        }
        let page = trail.usage_logs("acct", &["r1".to_string()], PageRequest::new(1, 2));
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].workflow_execution_id.as_deref(), Some("wf-3"));
    }

    #[test]
    fn test_logs_are_scoped_to_account() {
        let trail = AuditTrail::new();
        trail.record_change("other", "r1", &Actor::system(), "Created");
        assert!(trail.change_logs("acct", &["r1".to_string()]).is_empty());
    }
}
