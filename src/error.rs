//! Error types for the scheduling core.
//!
//! One enum per failure domain. Everything here is recoverable from the
//! caller's point of view: the core surfaces errors through task futures
//! and never aborts the process on its own account.

use thiserror::Error;

/// Error settled into a caller's future when a queued task fails.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task body returned an error.
    #[error("{0}")]
    Failed(String),

    /// The task body panicked. The pump survives; the caller gets this.
    #[error("task panicked")]
    Panicked,

    /// The task was dropped before it could settle (shutdown).
    #[error("task cancelled before completion")]
    Cancelled,
}

impl TaskError {
    /// Wrap any displayable error as a task failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Error from credential resolution.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("auth resolution failed for {provider}: {reason}")]
    Resolution { provider: String, reason: String },

    /// Every profile (and the profile-less default) failed or was skipped.
    #[error("no usable auth profile for {provider}")]
    Exhausted { provider: String },
}

impl AuthError {
    pub fn resolution(provider: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        AuthError::Resolution {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }
}

/// Error from an agent worker run.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    /// The provider rejected the credential (HTTP 401 equivalent).
    #[error("provider {provider} rejected the credential")]
    Unauthorized { provider: String },

    #[error("{0}")]
    Failed(String),
}

/// Error surfaced by the dispatcher to the transport caller.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("no auth available for provider {provider}")]
    AuthUnavailable { provider: String },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Error loading or validating settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Error from the announce collaborator (delivery of a subagent outcome
/// back to its requester).
#[derive(Debug, Clone, Error)]
#[error("announce failed: {0}")]
pub struct AnnounceError(pub String);

/// Error from the session-store collaborator. Deletions are best-effort;
/// the registry logs and swallows these.
#[derive(Debug, Clone, Error)]
#[error("session store error: {0}")]
pub struct SessionStoreError(pub String);
