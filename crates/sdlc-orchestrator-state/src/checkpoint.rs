// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Per-task checkpoints.
//!
//! A checkpoint captures a task's progress and restored context under
//! `checkpoints/{task_id}.json`, guarded by a SHA-256 integrity checksum of
//! the JSON body minus the checksum field. A load that fails verification
//! falls back to the newest valid history copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::store::{atomic_write, sha256_hex, StateStoreError, StateStoreResult};

/// Durable progress record for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub task_id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub created_at: DateTime<Utc>,
    /// Free-form progress markers (phase, counters, partial results).
    pub progress: Value,
    /// Context needed to resume the task where it left off.
    pub context: Value,
    /// SHA-256 of this document serialized with `checksum` set to "".
    pub checksum: String,
}

impl TaskCheckpoint {
    pub fn new(
        task_id: impl Into<String>,
        workflow_id: impl Into<String>,
        step_id: impl Into<String>,
        progress: Value,
        context: Value,
    ) -> Self {
        let mut checkpoint = Self {
            task_id: task_id.into(),
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            created_at: Utc::now(),
            progress,
            context,
            checksum: String::new(),
        };
        checkpoint.checksum = checkpoint.compute_checksum();
        checkpoint
    }

    fn compute_checksum(&self) -> String {
        let mut body = self.clone();
        body.checksum = String::new();
        // Struct field order is stable, so the digest is deterministic.
        serde_json::to_vec(&body)
            .map(|bytes| sha256_hex(&bytes))
            .unwrap_or_default()
    }

    /// Whether the embedded checksum matches the body.
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

fn checkpoints_dir(root: &Path) -> PathBuf {
    root.join("checkpoints")
}

fn checkpoint_path(root: &Path, task_id: &str) -> PathBuf {
    checkpoints_dir(root).join(format!("{task_id}.json"))
}

fn history_dir(root: &Path) -> PathBuf {
    checkpoints_dir(root).join("history")
}

/// Persist a checkpoint atomically, keeping the previous version in history.
pub async fn save_checkpoint(root: &Path, checkpoint: &TaskCheckpoint) -> StateStoreResult<()> {
    let path = checkpoint_path(root, &checkpoint.task_id);
    tokio::fs::create_dir_all(history_dir(root)).await?;

    if path.exists() {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let backup = history_dir(root).join(format!("{}.{stamp}.json", checkpoint.task_id));
        tokio::fs::copy(&path, backup).await?;
    }

    atomic_write(&path, &serde_json::to_vec_pretty(checkpoint)?).await
}

/// Load a checkpoint, verifying its checksum. Verification failures fall
/// back to history copies, newest first.
pub async fn load_checkpoint(root: &Path, task_id: &str) -> StateStoreResult<TaskCheckpoint> {
    let path = checkpoint_path(root, task_id);

    if let Some(checkpoint) = read_valid(&path).await {
        return Ok(checkpoint);
    }
    warn!(task_id, "Checkpoint unusable; trying history copies");

    let history = history_dir(root);
    if history.exists() {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&history).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&format!("{task_id}.")) {
                entries.push(entry.path());
            }
        }
        entries.sort();
        for backup in entries.into_iter().rev() {
            if let Some(checkpoint) = read_valid(&backup).await {
                warn!(task_id, backup = %backup.display(), "Recovered checkpoint from history");
                return Ok(checkpoint);
            }
        }
    }

    if path.exists() {
        Err(StateStoreError::Corrupt(format!(
            "checkpoint '{}' failed verification and no backup was valid",
            task_id
        )))
    } else {
        Err(StateStoreError::NotFound(task_id.to_string()))
    }
}

async fn read_valid(path: &Path) -> Option<TaskCheckpoint> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let checkpoint: TaskCheckpoint = serde_json::from_slice(&bytes).ok()?;
    checkpoint.verify().then_some(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TaskCheckpoint {
        TaskCheckpoint::new(
            "task-7",
            "wf-1",
            "implement",
            json!({"files_done": 3}),
            json!({"cursor": "src/main.rs"}),
        )
    }

    #[test]
    fn test_checksum_verifies() {
        let checkpoint = sample();
        assert!(checkpoint.verify());

        let mut tampered = checkpoint.clone();
        tampered.progress = json!({"files_done": 99});
        assert!(!tampered.verify());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = sample();

        save_checkpoint(dir.path(), &checkpoint).await.unwrap();
        let loaded = load_checkpoint(dir.path(), "task-7").await.unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_falls_back_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let first = sample();
        save_checkpoint(dir.path(), &first).await.unwrap();

        // Second save rotates the first into history.
        let second = TaskCheckpoint::new(
            "task-7",
            "wf-1",
            "implement",
            json!({"files_done": 4}),
            json!({}),
        );
        save_checkpoint(dir.path(), &second).await.unwrap();

        // Corrupt the live file.
        tokio::fs::write(checkpoint_path(dir.path(), "task-7"), b"junk")
            .await
            .unwrap();

        let loaded = load_checkpoint(dir.path(), "task-7").await.unwrap();
        assert_eq!(loaded, first);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_checkpoint(dir.path(), "nope").await.unwrap_err();
        assert!(matches!(err, StateStoreError::NotFound(_)));
    }
}
