// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Event-sourced, file-backed state persistence for SDLC workflows.
//!
//! A workflow's authoritative history is its append-only event log; the
//! snapshot is a deterministic fold of that log. The engine is the single
//! writer; CLI inspectors read snapshots concurrently under the
//! atomic-rename invariant.
//!
//! # Example
//!
//! ```rust
//! use sdlc_orchestrator_state::{StoredEvent, WorkflowEvent, WorkflowState, STATE_SCHEMA_VERSION};
//! use std::collections::BTreeMap;
//!
//! let mut state = WorkflowState::empty();
//! state.apply(&WorkflowEvent::WorkflowStarted {
//!     workflow_id: "build-service".to_string(),
//!     schema_version: STATE_SCHEMA_VERSION,
//!     variables: BTreeMap::new(),
//!     started_at: chrono::Utc::now(),
//! });
//! assert_eq!(state.workflow_id, "build-service");
//! assert_eq!(state.applied_events, 1);
//! ```

pub mod checkpoint;
pub mod events;
pub mod manifest;
pub mod models;
pub mod store;

// Re-export commonly used types
pub use checkpoint::{load_checkpoint, save_checkpoint, TaskCheckpoint};
pub use events::{StoredEvent, WorkflowEvent};
pub use manifest::{render_manifest, ManifestStep};
pub use models::{
    Artifact, ArtifactStatus, BlockReport, BlockedStep, ExecutionError, ExecutionStatus,
    StepExecution, WorkflowState, WorkflowStatus, WorkflowSummary, STATE_SCHEMA_VERSION,
};
pub use store::{
    atomic_write, sha256_hex, FileStateStore, LastPointer, LoadedState, StateStoreError,
    StateStoreResult,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
