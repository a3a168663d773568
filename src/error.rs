//! Error types for sandbox lifecycle and execution.

use std::time::Duration;

use thiserror::Error;

/// Message shown to end users when no sandbox can be provided.
pub const UNAVAILABLE_MESSAGE: &str = "execution environment unavailable";

/// Errors surfaced by the sandbox manager and executor.
///
/// Values are `Clone` because one creation outcome is shared with every
/// caller awaiting the same pending creation.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// Another holder kept the session lock past the wait bound.
    #[error("timed out after {waited:?} waiting for the sandbox lock of session {session_id}")]
    LockTimeout { session_id: String, waited: Duration },

    /// The provider rejected volume, image or sandbox creation.
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),

    /// A command could not be executed (transport failure or timeout).
    #[error("command execution failed: {0}")]
    Exec(String),

    /// A file write failed, including post-write verification.
    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    /// A file read exceeded its timeout.
    #[error("timed out reading {0}")]
    ReadTimeout(String),

    /// The requested file does not exist inside the workspace.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Lifecycle or lease storage failed.
    #[error("sandbox state store error: {0}")]
    Store(String),
}

impl SandboxError {
    pub fn write(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. } | Self::Provision(_) | Self::Store(_) | Self::ReadTimeout(_)
        )
    }

    /// Text that is safe to show to end users.
    pub fn public_message(&self) -> String {
        match self {
            Self::LockTimeout { .. } | Self::Provision(_) | Self::Store(_) => {
                UNAVAILABLE_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<StoreError> for SandboxError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Errors reported by a compute provider backend.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The sandbox no longer exists on the provider side.
    #[error("sandbox {0} is gone")]
    Gone(String),

    #[error("provider call timed out")]
    Timeout,

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

/// Errors from the SQLite-backed lifecycle and lease store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_distinct_from_provisioning() {
        let lock = SandboxError::LockTimeout {
            session_id: "s1".into(),
            waited: Duration::from_secs(1),
        };
        let provision = SandboxError::Provision("image pull failed".into());
        assert!(matches!(lock, SandboxError::LockTimeout { .. }));
        assert!(!matches!(provision, SandboxError::LockTimeout { .. }));
        assert!(lock.is_retryable());
        assert!(provision.is_retryable());
    }

    #[test]
    fn provider_details_are_hidden_from_users() {
        let err = SandboxError::Provision("quota exceeded for org acme".into());
        assert_eq!(err.public_message(), UNAVAILABLE_MESSAGE);
        assert!(!err.public_message().contains("acme"));
    }

    #[test]
    fn caller_errors_are_not_retryable() {
        assert!(!SandboxError::NotFound("/workspace/a.txt".into()).is_retryable());
        assert!(!SandboxError::write("/workspace/a.txt", "disk full").is_retryable());
    }
}
