// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Data models for workflow state persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Current on-disk schema version for persisted state.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// Workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// State has been created but the engine loop has not started.
    Initialized,
    /// Workflow is currently running.
    Running,
    /// Workflow is paused by an external request.
    Paused,
    /// Workflow completed successfully.
    Completed,
    /// Workflow failed terminally.
    Failed,
    /// No step can advance; see the block report.
    Blocked,
    /// Workflow was cancelled by an external request.
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states admit no further execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initialized" => Ok(Self::Initialized),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

/// Final status of a single step attempt envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Attempt is in flight.
    Running,
    /// Step completed successfully.
    Completed,
    /// Step failed with an error.
    Failed,
    /// Step timed out after exhausting its retries.
    Timeout,
    /// Step was cancelled (externally or by a sibling's fatal error).
    Cancelled,
    /// Step was skipped.
    Skipped,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Registration status of a named artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Declared or invalidated; not currently usable by consumers.
    Pending,
    /// Detected on disk and registered.
    Complete,
    /// Producer failed.
    Failed,
    /// Declared but not found on disk.
    Missing,
}

/// A named, filesystem-addressable output. The name is the stable key
/// referenced by `requires`/`creates`; the path is project-relative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: String,
    pub status: ArtifactStatus,
    /// Producer step id; `None` for externally-supplied inputs.
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the artifact content, when change detection is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Supersede counter; bumped each time a loopback re-registers the entry.
    #[serde(default)]
    pub version: u32,
}

/// Classified error recorded on a step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Error kind, e.g. `invalid_input`, `timeout_after_retries_exhausted`.
    pub kind: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Append-only record of one step attempt envelope (all retries included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    /// Number of attempts consumed by this envelope (1 = no retries).
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// Wall-clock duration in milliseconds.
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Opaque numeric metrics reported by the handler (scores, coverage).
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// One waiting step and the artifacts it is still missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedStep {
    pub step_id: String,
    pub missing: Vec<String>,
}

/// Diagnosis produced when no step can advance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockReport {
    pub entries: Vec<BlockedStep>,
}

impl BlockReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for BlockReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "[{}: missing {:?}]", entry.step_id, entry.missing)?;
        }
        Ok(())
    }
}

/// Workflow state snapshot, reconstructed deterministically from the event log.
///
/// Every field is derived from applied events; timestamps are copied from the
/// events themselves so a replay reproduces the snapshot byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub schema_version: u32,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_steps: BTreeSet<String>,
    pub failed_steps: BTreeSet<String>,
    pub artifacts: BTreeMap<String, Artifact>,
    pub step_executions: Vec<StepExecution>,
    /// Free-form key/value context passed through to handlers.
    pub variables: BTreeMap<String, Value>,
    /// Gate step id -> number of loopbacks taken so far.
    pub loopback_counters: BTreeMap<String, u32>,
    /// Number of events folded into this snapshot; resume replays past it.
    pub applied_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_report: Option<BlockReport>,
}

impl WorkflowState {
    /// Create an empty state for a workflow. The `workflow_started` event
    /// fills in identity and timestamps.
    pub fn empty() -> Self {
        Self {
            workflow_id: String::new(),
            schema_version: STATE_SCHEMA_VERSION,
            status: WorkflowStatus::Initialized,
            started_at: None,
            updated_at: None,
            completed_at: None,
            completed_steps: BTreeSet::new(),
            failed_steps: BTreeSet::new(),
            artifacts: BTreeMap::new(),
            step_executions: Vec::new(),
            variables: BTreeMap::new(),
            loopback_counters: BTreeMap::new(),
            applied_events: 0,
            error: None,
            block_report: None,
        }
    }

    /// Number of times a gate step has looped back.
    pub fn loopback_count(&self, step_id: &str) -> u32 {
        self.loopback_counters.get(step_id).copied().unwrap_or(0)
    }

    /// Whether the named artifact is registered and complete.
    pub fn artifact_complete(&self, name: &str) -> bool {
        self.artifacts
            .get(name)
            .map(|a| a.status == ArtifactStatus::Complete)
            .unwrap_or(false)
    }

    /// Latest execution record for a step, if any.
    pub fn last_execution(&self, step_id: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|e| e.step_id == step_id)
    }

    /// Check the structural invariants every persisted state must satisfy.
    ///
    /// The loopback bound is supplied by the caller because it lives in the
    /// workflow definition, not the state.
    pub fn validate(&self, max_loopback_iterations: u32) -> Result<(), String> {
        for (name, artifact) in &self.artifacts {
            if let Some(creator) = &artifact.created_by {
                if !self.completed_steps.contains(creator)
                    && artifact.status == ArtifactStatus::Complete
                {
                    return Err(format!(
                        "artifact '{}' created by '{}' which is not in completed_steps",
                        name, creator
                    ));
                }
            }
        }

        if let Some(overlap) = self.completed_steps.intersection(&self.failed_steps).next() {
            return Err(format!(
                "step '{}' is in both completed_steps and failed_steps",
                overlap
            ));
        }

        for (step_id, count) in &self.loopback_counters {
            if *count > max_loopback_iterations {
                return Err(format!(
                    "loopback counter for '{}' is {} (bound {})",
                    step_id, count, max_loopback_iterations
                ));
            }
        }

        Ok(())
    }
}

/// One-line summary used by `status`/`list` inspectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowState> for WorkflowSummary {
    fn from(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            completed_steps: state.completed_steps.len(),
            failed_steps: state.failed_steps.len(),
            updated_at: state.updated_at,
        }
    }
}
