//! Parent-tracked subagent runs: registration, completion fan-out,
//! persistence, and archival.
//!
//! The registry listens on the event bus for worker lifecycle events and
//! never calls into workers itself. Completion wakes every waiter, emits a
//! synthetic `subagent_complete` event toward the requester session, and
//! hands the outcome to the announce collaborator.

mod registry;
mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AnnounceError, SessionStoreError};

pub use registry::{RegisterSubagent, SubagentRegistry};
pub use store::RunStore;

/// What happens to a run's record once its outcome was announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Remove the record entirely.
    Delete,
    /// Keep the record (marked cleaned) until the archival sweep.
    Keep,
}

/// How a run finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Ok,
    Error { message: String },
    Timeout,
}

impl RunOutcome {
    /// Short tag for event payloads and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            RunOutcome::Ok => "ok",
            RunOutcome::Error { .. } => "error",
            RunOutcome::Timeout => "timeout",
        }
    }
}

/// One tracked subagent run. Persisted as-is; readers tolerate unknown
/// fields so older builds can load newer files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    #[serde(default)]
    pub requester_display_key: Option<String>,
    /// Transport descriptor for the requester, opaque to the core.
    #[serde(default)]
    pub requester_origin: serde_json::Value,
    pub task: String,
    pub cleanup: CleanupMode,
    #[serde(default)]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub archive_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cleanup_handled: bool,
    #[serde(default)]
    pub cleanup_completed_at: Option<DateTime<Utc>>,
}

impl SubagentRun {
    pub fn ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Request handed to the announce collaborator.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub run: SubagentRun,
    /// False on restart resume: deliver without waiting on the requester's
    /// own run to settle.
    pub wait_for_completion: bool,
}

/// Result of an announce attempt.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceReceipt {
    pub did_announce: bool,
}

/// Delivers a completed subagent's outcome to its requester.
#[async_trait]
pub trait AnnounceFlow: Send + Sync {
    async fn announce(&self, req: AnnounceRequest) -> Result<AnnounceReceipt, AnnounceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteSessionOptions {
    pub delete_transcript: bool,
}

/// External session storage. Deletion is best-effort; the registry logs
/// and swallows failures.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn delete(
        &self,
        session_key: &str,
        opts: DeleteSessionOptions,
    ) -> Result<(), SessionStoreError>;
}
