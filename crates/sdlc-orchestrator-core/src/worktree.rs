// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Per-attempt isolated working directories.
//!
//! Each worktree is a subdirectory keyed by a hash of
//! `(workflow_id, step_id, attempt)`. The manager keeps a registry so
//! `cleanup_all` stays idempotent across crashes: on startup it reconciles
//! the on-disk directory against live executions and deletes orphans.
//!
//! Failing to create a worktree is a hard failure for the step; there is no
//! fallback to the shared project root.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Manager for isolated step sandboxes under one root directory.
#[derive(Debug)]
pub struct WorktreeManager {
    root: PathBuf,
    registry: Mutex<HashMap<String, PathBuf>>,
}

impl WorktreeManager {
    /// Create a manager rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| EngineError::Worktree(format!("cannot create root: {e}")))?;
        Ok(Self {
            root,
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Worktree root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key(workflow_id: &str, step_id: &str, attempt: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{workflow_id}/{step_id}/{attempt}"));
        let digest = format!("{:x}", hasher.finalize());
        format!("{step_id}-{}", &digest[..12])
    }

    /// Create a fresh isolated directory for one step attempt.
    pub fn acquire(&self, workflow_id: &str, step_id: &str, attempt: u32) -> Result<PathBuf> {
        let key = Self::key(workflow_id, step_id, attempt);
        let path = self.root.join(&key);

        // A stale directory from a crashed prior run must not leak state
        // into this attempt.
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| EngineError::Worktree(format!("cannot clear stale '{key}': {e}")))?;
        }
        std::fs::create_dir_all(&path)
            .map_err(|e| EngineError::Worktree(format!("cannot create '{key}': {e}")))?;

        self.registry.lock().insert(key.clone(), path.clone());
        debug!(step_id, attempt, worktree = %path.display(), "Acquired worktree");
        Ok(path)
    }

    /// Remove a worktree directory. Safe to call twice.
    pub fn release(&self, path: &Path) {
        match std::fs::remove_dir_all(path) {
            Ok(()) => debug!(worktree = %path.display(), "Released worktree"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(worktree = %path.display(), %e, "Failed to remove worktree"),
        }
        self.registry.lock().retain(|_, p| p != path);
    }

    /// Remove every worktree, registered or orphaned. Idempotent.
    pub fn cleanup_all(&self) {
        let registered: Vec<PathBuf> = self.registry.lock().drain().map(|(_, p)| p).collect();
        for path in registered {
            self.release(&path);
        }

        // Orphans left behind by a crash.
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                warn!(worktree = %path.display(), "Removing orphaned worktree");
                let _ = std::fs::remove_dir_all(&path);
            }
        }
    }

    /// Scoped guard that releases the worktree on drop (including panics
    /// and cancellation unwinds).
    pub fn guard(self: &Arc<Self>, path: PathBuf) -> WorktreeGuard {
        WorktreeGuard {
            manager: Arc::clone(self),
            path: Some(path),
        }
    }
}

/// RAII release handle for one worktree.
#[derive(Debug)]
pub struct WorktreeGuard {
    manager: Arc<WorktreeManager>,
    path: Option<PathBuf>,
}

impl Drop for WorktreeGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.manager.release(&path);
        }
    }
}
