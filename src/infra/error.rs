//! Error types for the synchronization core

use std::time::Duration;

use thiserror::Error;

use crate::domain::{EntityKey, FailureKind};

/// Typed failure returned by the remote system adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network blip, 5xx, timeout: safe to retry
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Remote asked us to slow down, optionally saying for how long
    #[error("remote rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Validation rejected, not found, forbidden: never retried
    #[error("permanent remote error: {0}")]
    Permanent(String),

    /// A single attempt exceeded its timeout
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
}

impl RemoteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Transient(_) => FailureKind::Transient,
            RemoteError::RateLimited { .. } => FailureKind::RateLimited,
            RemoteError::Permanent(_) => FailureKind::Permanent,
            RemoteError::Timeout(_) => FailureKind::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, RemoteError::Permanent(_))
    }
}

/// Errors surfaced by the synchronization core
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Entity has never been mirrored and the remote could not supply it
    #[error("entity not available: {key} (last error: {last_error})")]
    NotAvailable {
        key: EntityKey,
        last_error: FailureKind,
    },

    /// Remote rejected the operation; it will not be retried
    #[error("remote rejected {operation}: {message}")]
    PermanentRemote { operation: String, message: String },

    /// Retry budget spent without a successful attempt
    #[error("{operation} failed after {attempts} attempts ({kind}): {message}")]
    RetriesExhausted {
        operation: String,
        kind: FailureKind,
        attempts: u32,
        message: String,
    },

    /// Another worker held the refresh lease for longer than we could wait
    #[error("refresh lease for {key} still held after {waited_ms}ms")]
    LeaseContention { key: EntityKey, waited_ms: u64 },

    /// Same idempotency key reused with a different payload
    #[error("idempotency conflict for {operation} key {key}: payload differs from original request")]
    IdempotencyConflict { operation: String, key: String },

    /// A recorded intent has no outcome; the remote effect is unknown
    #[error("write {operation}/{key} is in doubt: intent {intent_log_id} has no recorded outcome")]
    WriteInDoubt {
        operation: String,
        key: String,
        intent_log_id: i64,
    },

    /// Invariant violation
    #[error("invariant violation: {invariant} - {message}")]
    InvariantViolation { invariant: String, message: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return SyncError::InvariantViolation {
                    invariant: "single_ok_outcome".to_string(),
                    message: db_err.message().to_string(),
                };
            }
        }
        SyncError::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        SyncError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        assert!(RemoteError::Transient("503".into()).is_retryable());
        assert!(RemoteError::RateLimited { retry_after: None }.is_retryable());
        assert!(RemoteError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RemoteError::Permanent("invalid amount".into()).is_retryable());
        assert_eq!(
            RemoteError::RateLimited { retry_after: None }.kind(),
            FailureKind::RateLimited
        );
    }
}
