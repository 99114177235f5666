// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! File-backed, event-sourced state store.
//!
//! Layout under the state root:
//!
//! ```text
//! workflow-state/{workflow_id}/state.json        latest snapshot
//! workflow-state/{workflow_id}/state.meta.json   checksum + schema sidecar
//! workflow-state/{workflow_id}/events.log        append-only JSONL event log
//! workflow-state/{workflow_id}/history/          rotated snapshots
//! workflow-state/{workflow_id}/task-manifest.md  human-readable task list
//! workflow-state/last.json                       pointer to most recent workflow
//! ```
//!
//! Snapshot-class writes use write-temp, fsync, atomic-rename so a crash
//! mid-write leaves the previous consistent state intact. The event log is
//! append-only; the loader tolerates a torn trailing record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::events::StoredEvent;
use crate::models::{WorkflowState, WorkflowSummary, STATE_SCHEMA_VERSION};

/// How many rotated snapshots to keep per workflow.
const HISTORY_KEEP: usize = 10;

/// Error types for state store operations.
#[derive(Error, Debug)]
pub enum StateStoreError {
    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No state exists for the workflow.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persisted state violates an invariant.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Snapshot or log content failed integrity checks and no backup was valid.
    #[error("Corrupt state: {0}")]
    Corrupt(String),

    /// Snapshot was written by a newer schema than this binary understands.
    #[error("Unsupported state schema version {0}")]
    UnsupportedSchemaVersion(u32),
}

impl From<serde_json::Error> for StateStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for state store operations.
pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// Sidecar metadata written next to every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    schema_version: u32,
    /// SHA-256 hex digest of the snapshot file bytes.
    checksum: String,
    applied_events: u64,
    written_at: DateTime<Utc>,
}

/// Pointer to the most recently updated workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastPointer {
    pub workflow_id: String,
    pub snapshot: String,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a validated load, reporting backup usage.
#[derive(Debug, Clone)]
pub struct LoadedState {
    pub state: WorkflowState,
    /// Set when the primary snapshot was unusable and a history backup
    /// (named here) was loaded instead.
    pub recovered_from: Option<String>,
}

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Write bytes via temp file + fsync + atomic rename.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> StateStoreResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// File-backed state store. One writer (the engine) appends events and
/// snapshots; readers may load snapshots concurrently and see point-in-time
/// consistency through the atomic-rename invariant.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Create a store rooted at the given state directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// State root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflows_dir(&self) -> PathBuf {
        self.root.join("workflow-state")
    }

    /// Per-workflow state directory.
    pub fn workflow_dir(&self, workflow_id: &str) -> PathBuf {
        self.workflows_dir().join(workflow_id)
    }

    fn snapshot_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("state.json")
    }

    fn meta_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("state.meta.json")
    }

    fn events_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("events.log")
    }

    fn history_dir(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("history")
    }

    fn last_path(&self) -> PathBuf {
        self.workflows_dir().join("last.json")
    }

    fn cancel_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("cancel.request")
    }

    fn pause_path(&self, workflow_id: &str) -> PathBuf {
        self.workflow_dir(workflow_id).join("pause.request")
    }

    /// Whether any state exists for the workflow.
    pub fn exists(&self, workflow_id: &str) -> bool {
        self.snapshot_path(workflow_id).exists()
    }

    /// Initialize a fresh workflow state directory. Any previous snapshot is
    /// rotated into history and the event log is truncated.
    pub async fn init_workflow(&self, state: &WorkflowState) -> StateStoreResult<()> {
        let dir = self.workflow_dir(&state.workflow_id);
        tokio::fs::create_dir_all(dir.join("history")).await?;

        if self.snapshot_path(&state.workflow_id).exists() {
            self.rotate_snapshot(&state.workflow_id).await?;
        }
        tokio::fs::write(self.events_path(&state.workflow_id), b"").await?;
        self.write_snapshot(state).await
    }

    /// Append one event to the workflow's log.
    pub async fn append_event(
        &self,
        workflow_id: &str,
        event: &StoredEvent,
    ) -> StateStoreResult<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(workflow_id))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        debug!(
            workflow_id,
            seq = event.seq,
            event_type = event.event.event_type(),
            "Appended event"
        );
        Ok(())
    }

    /// Write a snapshot atomically, rotating the previous one into history
    /// and updating the latest-pointer file.
    pub async fn write_snapshot(&self, state: &WorkflowState) -> StateStoreResult<()> {
        let dir = self.workflow_dir(&state.workflow_id);
        tokio::fs::create_dir_all(dir.join("history")).await?;

        let path = self.snapshot_path(&state.workflow_id);
        if path.exists() {
            self.rotate_snapshot(&state.workflow_id).await?;
        }

        let bytes = serde_json::to_vec_pretty(state)?;
        atomic_write(&path, &bytes).await?;

        let meta = SnapshotMeta {
            schema_version: state.schema_version,
            checksum: sha256_hex(&bytes),
            applied_events: state.applied_events,
            written_at: Utc::now(),
        };
        atomic_write(
            &self.meta_path(&state.workflow_id),
            &serde_json::to_vec_pretty(&meta)?,
        )
        .await?;

        let pointer = LastPointer {
            workflow_id: state.workflow_id.clone(),
            snapshot: path.to_string_lossy().into_owned(),
            updated_at: Utc::now(),
        };
        atomic_write(&self.last_path(), &serde_json::to_vec_pretty(&pointer)?).await?;

        debug!(
            workflow_id = %state.workflow_id,
            applied_events = state.applied_events,
            "Wrote snapshot"
        );
        Ok(())
    }

    /// Copy the current snapshot into history and prune old entries.
    async fn rotate_snapshot(&self, workflow_id: &str) -> StateStoreResult<()> {
        let src = self.snapshot_path(workflow_id);
        let history = self.history_dir(workflow_id);
        tokio::fs::create_dir_all(&history).await?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        tokio::fs::copy(&src, history.join(format!("{stamp}.json"))).await?;

        // Prune oldest entries beyond the retention bound.
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&history).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();
        while entries.len() > HISTORY_KEEP {
            let oldest = entries.remove(0);
            let _ = tokio::fs::remove_file(oldest).await;
        }
        Ok(())
    }

    /// Load a workflow state: latest valid snapshot plus any newer events.
    ///
    /// A snapshot failing its checksum or parse falls back to the newest
    /// valid history backup; the result reports which backup was used. With
    /// no valid snapshot at all, the workflow is unrecoverable.
    pub async fn load(&self, workflow_id: &str) -> StateStoreResult<LoadedState> {
        if !self.workflow_dir(workflow_id).exists() {
            return Err(StateStoreError::NotFound(workflow_id.to_string()));
        }

        let (mut state, recovered_from) = self.load_snapshot(workflow_id).await?;

        // Replay events newer than the snapshot.
        let events = self
            .read_events(workflow_id, state.applied_events)
            .await?;
        for stored in &events {
            state.apply(&stored.event);
        }
        if !events.is_empty() {
            debug!(
                workflow_id,
                replayed = events.len(),
                "Replayed events past snapshot"
            );
        }

        state
            .validate(u32::MAX)
            .map_err(StateStoreError::InvalidState)?;

        Ok(LoadedState {
            state,
            recovered_from,
        })
    }

    async fn load_snapshot(
        &self,
        workflow_id: &str,
    ) -> StateStoreResult<(WorkflowState, Option<String>)> {
        match self.read_verified_snapshot(workflow_id).await {
            Ok(state) => Ok((state, None)),
            Err(err) => {
                warn!(workflow_id, %err, "Snapshot unusable; trying history backups");
                let (state, backup) = self.load_from_history(workflow_id).await?;
                Ok((state, Some(backup)))
            }
        }
    }

    async fn read_verified_snapshot(&self, workflow_id: &str) -> StateStoreResult<WorkflowState> {
        let bytes = tokio::fs::read(self.snapshot_path(workflow_id)).await?;
        let meta_bytes = tokio::fs::read(self.meta_path(workflow_id)).await?;
        let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes)?;

        if sha256_hex(&bytes) != meta.checksum {
            return Err(StateStoreError::Corrupt(format!(
                "snapshot checksum mismatch for '{}'",
                workflow_id
            )));
        }

        self.parse_snapshot(workflow_id, &bytes).await
    }

    /// Parse snapshot bytes, migrating older schema versions forward.
    async fn parse_snapshot(
        &self,
        workflow_id: &str,
        bytes: &[u8],
    ) -> StateStoreResult<WorkflowState> {
        let mut value: serde_json::Value = serde_json::from_slice(bytes)?;
        let version = value
            .get("schema_version")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32;

        if version > STATE_SCHEMA_VERSION {
            return Err(StateStoreError::UnsupportedSchemaVersion(version));
        }

        if version < STATE_SCHEMA_VERSION {
            value = migrate_snapshot_value(value, version)?;
            let state: WorkflowState = serde_json::from_value(value)?;
            // Preserve the pre-migration file in history, then persist at the
            // current version.
            self.rotate_snapshot(workflow_id).await?;
            self.write_snapshot(&state).await?;
            return Ok(state);
        }

        Ok(serde_json::from_value(value)?)
    }

    async fn load_from_history(
        &self,
        workflow_id: &str,
    ) -> StateStoreResult<(WorkflowState, String)> {
        let history = self.history_dir(workflow_id);
        let mut entries = Vec::new();
        if history.exists() {
            let mut dir = tokio::fs::read_dir(&history).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry.path());
            }
        }
        entries.sort();

        for path in entries.into_iter().rev() {
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            match self.parse_snapshot(workflow_id, &bytes).await {
                Ok(state) if state.validate(u32::MAX).is_ok() => {
                    let backup = path.to_string_lossy().into_owned();
                    warn!(workflow_id, backup = %backup, "Recovered from history backup");
                    return Ok((state, backup));
                }
                Ok(_) | Err(_) => continue,
            }
        }

        Err(StateStoreError::Corrupt(format!(
            "no valid snapshot or backup for '{}'",
            workflow_id
        )))
    }

    /// Read events with `seq` greater than `after_seq`, tolerating a torn
    /// trailing record (the log is truncated at the last fully written line).
    pub async fn read_events(
        &self,
        workflow_id: &str,
        after_seq: u64,
    ) -> StateStoreResult<Vec<StoredEvent>> {
        let path = self.events_path(workflow_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let lines: Vec<&str> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();

        let mut events = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<StoredEvent>(line) {
                Ok(event) => {
                    if event.seq > after_seq {
                        events.push(event);
                    }
                }
                Err(err) if index == lines.len() - 1 => {
                    warn!(workflow_id, %err, "Dropping torn trailing event record");
                    break;
                }
                Err(err) => {
                    return Err(StateStoreError::Corrupt(format!(
                        "event log record {} unreadable: {}",
                        index + 1,
                        err
                    )));
                }
            }
        }
        Ok(events)
    }

    /// Reader-side snapshot access (no replay, no recovery).
    pub async fn read_snapshot(&self, workflow_id: &str) -> StateStoreResult<WorkflowState> {
        let path = self.snapshot_path(workflow_id);
        if !path.exists() {
            return Err(StateStoreError::NotFound(workflow_id.to_string()));
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read the latest-pointer file, if present.
    pub async fn last(&self) -> StateStoreResult<Option<LastPointer>> {
        let path = self.last_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Summaries of every workflow found under the state root.
    pub async fn list(&self) -> StateStoreResult<Vec<WorkflowSummary>> {
        let dir = self.workflows_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            if let Ok(state) = self.read_snapshot(&id).await {
                summaries.push(WorkflowSummary::from(&state));
            }
        }
        summaries.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(summaries)
    }

    /// Request cancellation of a (possibly separate-process) running workflow.
    pub async fn request_cancel(&self, workflow_id: &str) -> StateStoreResult<()> {
        tokio::fs::create_dir_all(self.workflow_dir(workflow_id)).await?;
        tokio::fs::write(self.cancel_path(workflow_id), b"cancel\n").await?;
        Ok(())
    }

    /// Whether a cancel request marker exists.
    pub fn cancel_requested(&self, workflow_id: &str) -> bool {
        self.cancel_path(workflow_id).exists()
    }

    /// Remove the cancel request marker.
    pub async fn clear_cancel(&self, workflow_id: &str) -> StateStoreResult<()> {
        let path = self.cancel_path(workflow_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    /// Request a pause at the next batch boundary.
    pub async fn request_pause(&self, workflow_id: &str) -> StateStoreResult<()> {
        tokio::fs::create_dir_all(self.workflow_dir(workflow_id)).await?;
        tokio::fs::write(self.pause_path(workflow_id), b"pause\n").await?;
        Ok(())
    }

    /// Whether a pause request marker exists.
    pub fn pause_requested(&self, workflow_id: &str) -> bool {
        self.pause_path(workflow_id).exists()
    }

    /// Remove the pause request marker.
    pub async fn clear_pause(&self, workflow_id: &str) -> StateStoreResult<()> {
        let path = self.pause_path(workflow_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    /// Persist the workflow definition so `resume` can rebuild the engine
    /// without the original file.
    pub async fn write_definition(&self, workflow_id: &str, yaml: &str) -> StateStoreResult<()> {
        tokio::fs::create_dir_all(self.workflow_dir(workflow_id)).await?;
        atomic_write(
            &self.workflow_dir(workflow_id).join("workflow.yaml"),
            yaml.as_bytes(),
        )
        .await
    }

    /// Read back the persisted workflow definition.
    pub async fn read_definition(&self, workflow_id: &str) -> StateStoreResult<String> {
        let path = self.workflow_dir(workflow_id).join("workflow.yaml");
        if !path.exists() {
            return Err(StateStoreError::NotFound(format!(
                "definition for '{}'",
                workflow_id
            )));
        }
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Write the human-readable task manifest for a workflow.
    pub async fn write_manifest(&self, workflow_id: &str, content: &str) -> StateStoreResult<()> {
        tokio::fs::create_dir_all(self.workflow_dir(workflow_id)).await?;
        tokio::fs::write(
            self.workflow_dir(workflow_id).join("task-manifest.md"),
            content,
        )
        .await?;
        Ok(())
    }

    /// Persist the completion report next to the snapshot.
    pub async fn write_report(
        &self,
        workflow_id: &str,
        report: &serde_json::Value,
    ) -> StateStoreResult<()> {
        atomic_write(
            &self.workflow_dir(workflow_id).join("report.json"),
            &serde_json::to_vec_pretty(report)?,
        )
        .await
    }
}

/// Migrate a snapshot JSON value one version at a time up to the current
/// schema. Never mutates files in place; callers rename history first.
fn migrate_snapshot_value(
    mut value: serde_json::Value,
    from: u32,
) -> StateStoreResult<serde_json::Value> {
    let mut version = from;
    while version < STATE_SCHEMA_VERSION {
        value = match version {
            // v1 -> v2: `gate_counters` renamed to `loopback_counters`,
            // `events_applied` renamed to `applied_events`.
            1 => {
                if let Some(map) = value.as_object_mut() {
                    if let Some(counters) = map.remove("gate_counters") {
                        map.insert("loopback_counters".to_string(), counters);
                    }
                    if let Some(count) = map.remove("events_applied") {
                        map.insert("applied_events".to_string(), count);
                    }
                    map.insert(
                        "schema_version".to_string(),
                        serde_json::json!(STATE_SCHEMA_VERSION),
                    );
                }
                value
            }
            other => {
                return Err(StateStoreError::UnsupportedSchemaVersion(other));
            }
        };
        version += 1;
    }
    Ok(value)
}
