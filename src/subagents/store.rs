//! On-disk persistence for the subagent run map.
//!
//! The registry serializes the whole map on every mutation; writes flow
//! through a channel to a single writer task so their order matches the
//! order of mutations without holding any lock across I/O. Failures are
//! logged and swallowed: in-memory state wins and the next successful
//! write catches the file up.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::subagents::SubagentRun;

enum PersistMsg {
    Write(String),
    Flush(oneshot::Sender<()>),
}

/// Serialized store for `runId → record`.
pub struct RunStore {
    path: PathBuf,
    tx: mpsc::UnboundedSender<PersistMsg>,
}

impl RunStore {
    /// Create a store writing to `path`. Spawns the writer task, so this
    /// must be called inside a tokio runtime.
    pub fn new(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(path.clone(), rx));
        Self { path, tx }
    }

    /// Queue a snapshot of the run map for writing.
    ///
    /// Serialization happens here, inside the caller's critical section,
    /// so queued snapshots reflect mutations in order.
    pub fn persist(&self, runs: &HashMap<String, SubagentRun>) {
        let json = match serde_json::to_string_pretty(runs) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize subagent runs");
                return;
            }
        };
        let _ = self.tx.send(PersistMsg::Write(json));
    }

    /// Wait until every queued write has hit the disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PersistMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Load the persisted map. Missing or unreadable files yield an empty
    /// map; the registry starts fresh rather than failing init.
    pub async fn load(&self) -> HashMap<String, SubagentRun> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read subagent run store, starting empty"
                );
                return HashMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(runs) => runs,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to parse subagent run store, starting empty"
                );
                HashMap::new()
            }
        }
    }
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<PersistMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            PersistMsg::Write(json) => {
                if let Some(parent) = path.parent() {
                    if let Err(err) = tokio::fs::create_dir_all(parent).await {
                        tracing::warn!(error = %err, "failed to create run store directory");
                        continue;
                    }
                }
                if let Err(err) = tokio::fs::write(&path, json).await {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to write subagent run store"
                    );
                }
            }
            PersistMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subagents::CleanupMode;
    use chrono::Utc;

    fn sample_run(run_id: &str) -> SubagentRun {
        SubagentRun {
            run_id: run_id.to_string(),
            child_session_key: format!("subagent:{run_id}"),
            requester_session_key: "main".to_string(),
            requester_display_key: None,
            requester_origin: serde_json::json!({ "channel": "telegram" }),
            task: "summarize the inbox".to_string(),
            cleanup: CleanupMode::Keep,
            label: Some("inbox".to_string()),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
            outcome: None,
            archive_at: None,
            cleanup_handled: false,
            cleanup_completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runs.json"));

        let mut runs = HashMap::new();
        runs.insert("r1".to_string(), sample_run("r1"));
        runs.insert("r2".to_string(), sample_run("r2"));
        store.persist(&runs);
        store.flush().await;

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 2);
        let r1 = &loaded["r1"];
        assert_eq!(r1.child_session_key, "subagent:r1");
        assert_eq!(r1.cleanup, CleanupMode::Keep);
        assert_eq!(r1.label.as_deref(), Some("inbox"));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runs.json"));

        let mut runs = HashMap::new();
        runs.insert("r1".to_string(), sample_run("r1"));
        store.persist(&runs);
        runs.remove("r1");
        store.persist(&runs);
        store.flush().await;

        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("never-written.json"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let store = RunStore::new(path);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_reader_tolerates_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let json = serde_json::json!({
            "r1": {
                "runId": "r1",
                "childSessionKey": "subagent:r1",
                "requesterSessionKey": "main",
                "task": "do things",
                "cleanup": "delete",
                "createdAt": Utc::now(),
                "someFutureField": { "nested": true }
            }
        });
        tokio::fs::write(&path, json.to_string()).await.unwrap();

        let store = RunStore::new(path);
        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["r1"].cleanup, CleanupMode::Delete);
        assert!(loaded["r1"].started_at.is_none());
    }
}
