// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Workflow events.
//!
//! Every state change is captured as an immutable event. The engine is the
//! single writer; replaying the log from an empty state reproduces the
//! snapshot exactly, so all timestamps live on the events themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::{
    Artifact, ArtifactStatus, BlockReport, ExecutionError, StepExecution, WorkflowState,
    WorkflowStatus,
};

/// All possible workflow events.
///
/// Some variants (`StepStarted`, `StepRetrying`, `BatchCompleted`) are
/// observability-only: they are broadcast on the event bus but never appended
/// to the log, so applying them is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Workflow run began (or a fresh run was initialized).
    WorkflowStarted {
        workflow_id: String,
        schema_version: u32,
        variables: BTreeMap<String, Value>,
        started_at: DateTime<Utc>,
    },

    /// A step attempt began (bus only).
    StepStarted {
        step_id: String,
        attempt: u32,
        worktree_path: String,
        started_at: DateTime<Utc>,
    },

    /// A step attempt failed and will be retried (bus only).
    StepRetrying {
        step_id: String,
        attempt: u32,
        reason: String,
        at: DateTime<Utc>,
    },

    /// Step envelope finished successfully.
    StepSucceeded {
        execution: StepExecution,
        at: DateTime<Utc>,
    },

    /// Step envelope failed terminally (including timeout exhaustion).
    StepFailed {
        execution: StepExecution,
        at: DateTime<Utc>,
    },

    /// Step envelope was cancelled; the step stays eligible for re-execution.
    StepCancelled {
        execution: StepExecution,
        at: DateTime<Utc>,
    },

    /// An artifact was detected on disk and registered (or superseded).
    ArtifactRegistered {
        artifact: Artifact,
        at: DateTime<Utc>,
    },

    /// A gate step's metrics met every threshold.
    GatePassed {
        step_id: String,
        metrics: BTreeMap<String, f64>,
        at: DateTime<Utc>,
    },

    /// A gate step's metrics fell below one or more thresholds.
    GateFailed {
        step_id: String,
        /// New value of the gate's loopback counter.
        counter: u32,
        /// Threshold names that were not met.
        failed: Vec<String>,
        metrics: BTreeMap<String, f64>,
        at: DateTime<Utc>,
    },

    /// Gate loopback invalidated producer steps and their downstream closure.
    StepsInvalidated {
        gate_id: String,
        step_ids: Vec<String>,
        artifact_names: Vec<String>,
        at: DateTime<Utc>,
    },

    /// A context variable was set or overwritten.
    VariableSet {
        key: String,
        value: Value,
        at: DateTime<Utc>,
    },

    /// A batch of ready steps finished (bus only).
    BatchCompleted {
        step_ids: Vec<String>,
        at: DateTime<Utc>,
    },

    /// Workflow paused by external request.
    WorkflowPaused { at: DateTime<Utc> },

    /// Paused workflow resumed.
    WorkflowResumed { at: DateTime<Utc> },

    /// Workflow reached its terminal completed state.
    WorkflowCompleted { at: DateTime<Utc> },

    /// Workflow failed terminally.
    WorkflowFailed {
        error: ExecutionError,
        at: DateTime<Utc>,
    },

    /// No step can advance; the report lists outstanding requirements.
    WorkflowBlocked {
        report: BlockReport,
        at: DateTime<Utc>,
    },

    /// Workflow was cancelled.
    WorkflowCancelled { at: DateTime<Utc> },
}

impl WorkflowEvent {
    /// Event type name as stored in the log.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::StepCancelled { .. } => "step_cancelled",
            Self::ArtifactRegistered { .. } => "artifact_registered",
            Self::GatePassed { .. } => "gate_passed",
            Self::GateFailed { .. } => "gate_failed",
            Self::StepsInvalidated { .. } => "steps_invalidated",
            Self::VariableSet { .. } => "variable_set",
            Self::BatchCompleted { .. } => "batch_completed",
            Self::WorkflowPaused { .. } => "workflow_paused",
            Self::WorkflowResumed { .. } => "workflow_resumed",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowBlocked { .. } => "workflow_blocked",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
        }
    }

    /// Timestamp when the event occurred.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::WorkflowStarted { started_at, .. } => *started_at,
            Self::StepStarted { started_at, .. } => *started_at,
            Self::StepRetrying { at, .. }
            | Self::StepSucceeded { at, .. }
            | Self::StepFailed { at, .. }
            | Self::StepCancelled { at, .. }
            | Self::ArtifactRegistered { at, .. }
            | Self::GatePassed { at, .. }
            | Self::GateFailed { at, .. }
            | Self::StepsInvalidated { at, .. }
            | Self::VariableSet { at, .. }
            | Self::BatchCompleted { at, .. }
            | Self::WorkflowPaused { at }
            | Self::WorkflowResumed { at }
            | Self::WorkflowCompleted { at }
            | Self::WorkflowFailed { at, .. }
            | Self::WorkflowBlocked { at, .. }
            | Self::WorkflowCancelled { at } => *at,
        }
    }

    /// Whether this event belongs in the durable log (as opposed to the
    /// observability bus only).
    pub fn is_durable(&self) -> bool {
        !matches!(
            self,
            Self::StepStarted { .. } | Self::StepRetrying { .. } | Self::BatchCompleted { .. }
        )
    }
}

/// An event as stored in the append-only log (one JSON line each).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique event identifier, for correlation in logs and bug reports.
    pub event_id: Uuid,
    /// Position in the log, 1-based and monotonically increasing.
    pub seq: u64,
    #[serde(flatten)]
    pub event: WorkflowEvent,
}

impl StoredEvent {
    pub fn new(seq: u64, event: WorkflowEvent) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            seq,
            event,
        }
    }
}

impl WorkflowState {
    /// Fold a single event into the state.
    ///
    /// This is the only mutation path: the engine appends an event and then
    /// applies it, and resume replays the log through the same function.
    pub fn apply(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::WorkflowStarted {
                workflow_id,
                schema_version,
                variables,
                started_at,
            } => {
                self.workflow_id = workflow_id.clone();
                self.schema_version = *schema_version;
                self.status = WorkflowStatus::Running;
                self.started_at = Some(*started_at);
                for (key, value) in variables {
                    self.variables.insert(key.clone(), value.clone());
                }
            }

            WorkflowEvent::StepSucceeded { execution, .. } => {
                self.completed_steps.insert(execution.step_id.clone());
                self.failed_steps.remove(&execution.step_id);
                self.step_executions.push(execution.clone());
            }

            WorkflowEvent::StepFailed { execution, .. } => {
                self.failed_steps.insert(execution.step_id.clone());
                self.completed_steps.remove(&execution.step_id);
                self.step_executions.push(execution.clone());
            }

            WorkflowEvent::StepCancelled { execution, .. } => {
                // Neither completed nor failed: the step re-runs on resume.
                self.step_executions.push(execution.clone());
            }

            WorkflowEvent::ArtifactRegistered { artifact, .. } => {
                self.artifacts
                    .insert(artifact.name.clone(), artifact.clone());
            }

            WorkflowEvent::GatePassed { .. } => {}

            WorkflowEvent::GateFailed {
                step_id, counter, ..
            } => {
                self.loopback_counters.insert(step_id.clone(), *counter);
            }

            WorkflowEvent::StepsInvalidated {
                step_ids,
                artifact_names,
                ..
            } => {
                for step_id in step_ids {
                    self.completed_steps.remove(step_id);
                    self.failed_steps.remove(step_id);
                }
                for name in artifact_names {
                    if let Some(artifact) = self.artifacts.get_mut(name) {
                        artifact.status = ArtifactStatus::Pending;
                    }
                }
            }

            WorkflowEvent::VariableSet { key, value, .. } => {
                self.variables.insert(key.clone(), value.clone());
            }

            WorkflowEvent::WorkflowPaused { .. } => {
                self.status = WorkflowStatus::Paused;
            }

            WorkflowEvent::WorkflowResumed { .. } => {
                self.status = WorkflowStatus::Running;
                self.block_report = None;
            }

            WorkflowEvent::WorkflowCompleted { at } => {
                self.status = WorkflowStatus::Completed;
                self.completed_at = Some(*at);
                self.block_report = None;
            }

            WorkflowEvent::WorkflowFailed { error, at } => {
                self.status = WorkflowStatus::Failed;
                self.completed_at = Some(*at);
                self.error = Some(error.clone());
            }

            WorkflowEvent::WorkflowBlocked { report, .. } => {
                self.status = WorkflowStatus::Blocked;
                self.block_report = Some(report.clone());
            }

            WorkflowEvent::WorkflowCancelled { at } => {
                self.status = WorkflowStatus::Cancelled;
                self.completed_at = Some(*at);
            }

            // Observability-only events carry no state.
            WorkflowEvent::StepStarted { .. }
            | WorkflowEvent::StepRetrying { .. }
            | WorkflowEvent::BatchCompleted { .. } => {}
        }

        self.updated_at = Some(event.occurred_at());
        self.applied_events += 1;
    }
}
