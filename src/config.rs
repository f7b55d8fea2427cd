//! Runtime settings.
//!
//! Settings come from defaults, optionally a JSON file, then
//! `SECRETKEEPER_*` environment variables, later sources winning.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SecretsError};

/// Global account id environment variable.
pub const ENV_GLOBAL_ACCOUNT_ID: &str = "SECRETKEEPER_GLOBAL_ACCOUNT_ID";
/// Mask token environment variable.
pub const ENV_SECRET_MASK: &str = "SECRETKEEPER_SECRET_MASK";
/// Transition poll interval (milliseconds) environment variable.
pub const ENV_TRANSITION_POLL_INTERVAL_MS: &str = "SECRETKEEPER_TRANSITION_POLL_INTERVAL_MS";
/// Maximum file secret size environment variable.
pub const ENV_MAX_FILE_SIZE_BYTES: &str = "SECRETKEEPER_MAX_FILE_SIZE_BYTES";
/// Maximum managers per account environment variable.
pub const ENV_MAX_SECRET_MANAGERS: &str = "SECRETKEEPER_MAX_SECRET_MANAGERS";

/// Reserved account id owning the fallback configs.
pub const DEFAULT_GLOBAL_ACCOUNT_ID: &str = "__GLOBAL_ACCOUNT_ID__";
/// Replacement for secret fields on masked reads.
pub const DEFAULT_SECRET_MASK: &str = "**************";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsSettings {
    pub global_account_id: String,
    pub secret_mask: String,
    pub transition_poll_interval_ms: u64,
    pub max_file_size_bytes: usize,
    /// `None` means unlimited.
    pub max_secret_managers: Option<usize>,
}

impl Default for SecretsSettings {
    fn default() -> Self {
        Self {
            global_account_id: DEFAULT_GLOBAL_ACCOUNT_ID.to_string(),
            secret_mask: DEFAULT_SECRET_MASK.to_string(),
            transition_poll_interval_ms: 1_000,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_secret_managers: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<Result<T>>
where
    T::Err: std::fmt::Display,
{
    std::env::var(key).ok().map(|val| {
        val.trim()
            .parse()
            .map_err(|e| SecretsError::Config(format!("invalid {key}: {e}")))
    })
}

impl SecretsSettings {
    /// Parse settings from a JSON document. Missing keys keep defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SecretsError::Config(e.to_string()))
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SecretsError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&raw)?.with_env_overrides()
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(id) = std::env::var(ENV_GLOBAL_ACCOUNT_ID) {
            self.global_account_id = id;
        }
        if let Ok(mask) = std::env::var(ENV_SECRET_MASK) {
            self.secret_mask = mask;
        }
        if let Some(ms) = parse_env(ENV_TRANSITION_POLL_INTERVAL_MS) {
            self.transition_poll_interval_ms = ms?;
        }
        if let Some(size) = parse_env(ENV_MAX_FILE_SIZE_BYTES) {
            self.max_file_size_bytes = size?;
        }
        if let Some(max) = parse_env(ENV_MAX_SECRET_MANAGERS) {
            self.max_secret_managers = Some(max?);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_account_id.trim().is_empty() {
            return Err(SecretsError::Config("global_account_id must not be empty".into()));
        }
        if self.secret_mask.is_empty() {
            return Err(SecretsError::Config("secret_mask must not be empty".into()));
        }
        if self.transition_poll_interval_ms == 0 {
            return Err(SecretsError::Config(
                "transition_poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn transition_poll_interval(&self) -> Duration {
        Duration::from_millis(self.transition_poll_interval_ms)
    }
}

/// Decides whether an account may configure another secret manager.
pub trait Entitlements: Send + Sync {
    fn may_add_secret_manager(&self, account_id: &str, existing: usize) -> bool;
}

/// Limit taken from [`SecretsSettings::max_secret_managers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerLimit(pub Option<usize>);

impl Entitlements for ManagerLimit {
    fn may_add_secret_manager(&self, _account_id: &str, existing: usize) -> bool {
        self.0.map_or(true, |max| existing < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = SecretsSettings::from_json(r#"{"max_secret_managers": 2}"#).unwrap();
        assert_eq!(settings.max_secret_managers, Some(2));
        assert_eq!(settings.secret_mask, DEFAULT_SECRET_MASK);
        assert_eq!(settings.transition_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let settings = SecretsSettings {
            transition_poll_interval_ms: 0,
            ..SecretsSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_manager_limit() {
        assert!(ManagerLimit(None).may_add_secret_manager("a", 100));
        assert!(ManagerLimit(Some(1)).may_add_secret_manager("a", 0));
        assert!(!ManagerLimit(Some(1)).may_add_secret_manager("a", 1));
    }
}
