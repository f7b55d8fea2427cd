//! Error types for secretkeeper.
//!
//! Every variant is a distinct failure mode of the secrets core. Messages
//! identify *what* failed (which record, which config, which backend) and
//! never carry plaintext or key material.

use thiserror::Error;

use crate::model::EncryptionType;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SecretsError>;

/// The single error type for all secretkeeper operations.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Malformed input: bad name, missing or masked credentials, a backend
    /// that failed its validation round trip.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The account is not entitled to the requested feature.
    #[error("feature unavailable: {0}")]
    FeatureUnavailable(String),

    /// A remote backend rejected the call (bad key, bad token, unreachable).
    #[error("{backend} operation failed: {reason}")]
    Operation {
        backend: EncryptionType,
        reason: String,
    },

    /// A config or secret is still referenced and cannot be deleted.
    #[error("{entity} {id} is in use: {reason}")]
    InUse {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// Unknown config, record or job id.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Stored ciphertext could not be decrypted under its recorded config.
    /// Never retried.
    #[error("decryption of record {record_id} failed: {reason}")]
    Decryption { record_id: String, reason: String },

    /// Low-level primitive failure (randomness, key derivation, sealing).
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// The persistence layer (store, queue journal, audit sink) failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Settings could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SecretsError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn operation(backend: EncryptionType, reason: impl Into<String>) -> Self {
        Self::Operation {
            backend,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call could succeed. Only remote backend
    /// failures qualify; the core itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Operation { .. } | Self::Storage(_))
    }
}

impl From<serde_json::Error> for SecretsError {
    fn from(err: serde_json::Error) -> Self {
        SecretsError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for SecretsError {
    fn from(err: std::io::Error) -> Self {
        SecretsError::Storage(err.to_string())
    }
}
