// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Workflow engine: the top-level loop.
//!
//! Find ready steps, execute the batch, ingest artifacts, evaluate gates,
//! checkpoint, repeat until a terminal status. The engine is the single
//! writer of state: every mutation is an event appended to the log and then
//! folded into the in-memory state, so resume replays to the same place.

use chrono::{DateTime, Utc};
use sdlc_orchestrator_state::{
    render_manifest, save_checkpoint, Artifact, ArtifactStatus, BlockReport, ExecutionError,
    ExecutionStatus, FileStateStore, ManifestStep, StateStoreError, StepExecution, StoredEvent,
    TaskCheckpoint, WorkflowEvent, WorkflowState, WorkflowStatus, STATE_SCHEMA_VERSION,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::artifact::detect_artifacts;
use crate::context::RunContext;
use crate::dag::DependencyGraph;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::executor::{ParallelExecutor, PreparedStep, StepOutcome};
use crate::gate;
use crate::handler::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::workflow::{CheckpointPolicy, Step, Workflow};
use crate::worktree::WorktreeManager;

/// Aggregated run summary persisted as `report.json` at exit.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub workflow_id: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepReport>,
    pub artifacts: Vec<ArtifactReport>,
    pub loopback_counters: BTreeMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_report: Option<BlockReport>,
}

/// Per-step summary inside the completion report.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step_id: String,
    pub status: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub metrics: BTreeMap<String, f64>,
}

/// Artifact inventory entry inside the completion report.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactReport {
    pub name: String,
    pub status: String,
    pub version: u32,
    pub created_by: Option<String>,
}

/// Top-level orchestrator for one workflow.
pub struct WorkflowEngine {
    workflow: Workflow,
    graph: DependencyGraph,
    project_root: PathBuf,
    store: FileStateStore,
    worktrees: Arc<WorktreeManager>,
    executor: ParallelExecutor,
    bus: EventBus,
    cancel: CancellationToken,
    state: WorkflowState,
    steps_since_checkpoint: u32,
    last_checkpoint: Instant,
}

impl WorkflowEngine {
    /// Build an engine for a validated workflow.
    pub fn new(
        workflow: Workflow,
        project_root: impl Into<PathBuf>,
        store: FileStateStore,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        workflow.validate()?;
        let graph = DependencyGraph::from_workflow(&workflow)?;
        let project_root = project_root.into();

        let worktrees = Arc::new(WorktreeManager::new(
            store.root().join("worktrees").join(&workflow.id),
        )?);
        let bus = EventBus::new();
        let executor = ParallelExecutor::new(
            workflow.id.clone(),
            project_root.clone(),
            workflow.config.max_parallel,
            Duration::from_secs(workflow.config.default_timeout_secs),
            RetryPolicy::from(&workflow.config.retry),
            registry,
            Arc::clone(&worktrees),
            bus.clone(),
        );

        Ok(Self {
            workflow,
            graph,
            project_root,
            store,
            worktrees,
            executor,
            bus,
            cancel: CancellationToken::new(),
            state: WorkflowState::empty(),
            steps_since_checkpoint: 0,
            last_checkpoint: Instant::now(),
        })
    }

    /// Event bus for UI/log subscribers.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Cancellation handle; cancelling it stops the run at the next
    /// observation point (batch boundary or in-flight handler I/O).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current in-memory state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Drive the workflow to a stopping point: completed, failed, blocked,
    /// cancelled, or paused. Resuming a terminal workflow is a no-op that
    /// returns the final snapshot unchanged.
    #[instrument(skip(self), fields(workflow_id = %self.workflow.id))]
    pub async fn run(&mut self) -> Result<WorkflowState> {
        if self.store.exists(&self.workflow.id) {
            let loaded = self.store.load(&self.workflow.id).await?;
            self.state = loaded.state;
            if let Some(backup) = loaded.recovered_from {
                warn!(backup = %backup, "State recovered from history backup");
            }
            self.state
                .validate(self.workflow.config.max_loopback_iterations)
                .map_err(|msg| EngineError::State(StateStoreError::InvalidState(msg)))?;

            if self.state.status.is_terminal() {
                info!(status = %self.state.status, "Workflow already terminal; nothing to do");
                return Ok(self.state.clone());
            }
            match self.state.status {
                WorkflowStatus::Paused | WorkflowStatus::Blocked => {
                    self.append(WorkflowEvent::WorkflowResumed { at: Utc::now() })
                        .await?;
                }
                WorkflowStatus::Initialized => {
                    self.append(self.started_event()).await?;
                }
                _ => {}
            }
            info!(
                completed = self.state.completed_steps.len(),
                "Resuming workflow"
            );
        } else {
            let mut initial = WorkflowState::empty();
            initial.workflow_id = self.workflow.id.clone();
            self.store.init_workflow(&initial).await?;
            let definition = serde_yaml::to_string(&self.workflow)
                .map_err(|e| EngineError::parse(e.to_string()))?;
            self.store
                .write_definition(&self.workflow.id, &definition)
                .await?;
            self.state = initial;
            self.append(self.started_event()).await?;
            info!(steps = self.workflow.steps.len(), "Starting workflow");
        }

        // Sandboxes surviving a crash belong to no live execution.
        self.worktrees.cleanup_all();

        self.register_external_inputs().await?;

        let deadline = self.run_deadline();

        loop {
            if self.cancel.is_cancelled() || self.store.cancel_requested(&self.workflow.id) {
                return self.finish_cancelled().await;
            }
            if self.store.pause_requested(&self.workflow.id) {
                self.store.clear_pause(&self.workflow.id).await?;
                self.append(WorkflowEvent::WorkflowPaused { at: Utc::now() })
                    .await?;
                self.checkpoint().await?;
                info!("Workflow paused");
                return Ok(self.state.clone());
            }
            if let Some(deadline) = deadline {
                if Utc::now() > deadline {
                    self.append(WorkflowEvent::WorkflowFailed {
                        error: ExecutionError::new(
                            "workflow_timeout",
                            "workflow exceeded its configured wall-clock bound",
                        ),
                        at: Utc::now(),
                    })
                    .await?;
                    return self.finish().await;
                }
            }

            let ready = self.graph.ready_steps(&self.workflow, &self.state);
            if ready.is_empty() {
                return self.finish_no_ready().await;
            }
            debug!(?ready, "Executing batch");

            let prepared: Vec<PreparedStep> = ready
                .iter()
                .map(|id| self.prepare_step(id))
                .collect::<Result<_>>()?;
            let outcomes = self.executor.execute_batch(prepared, &self.cancel).await;

            let mut batch_fatal: Option<ExecutionError> = None;
            let mut saw_cancelled = false;
            for outcome in outcomes {
                if outcome.is_batch_fatal() {
                    batch_fatal = outcome.error.clone();
                }
                if outcome.status == ExecutionStatus::Cancelled {
                    saw_cancelled = true;
                }
                self.ingest(outcome).await?;
                if self.state.status.is_terminal() {
                    return self.finish().await;
                }
            }

            if let Some(error) = batch_fatal {
                self.append(WorkflowEvent::WorkflowFailed {
                    error,
                    at: Utc::now(),
                })
                .await?;
                return self.finish().await;
            }
            if saw_cancelled
                || self.cancel.is_cancelled()
                || self.store.cancel_requested(&self.workflow.id)
            {
                return self.finish_cancelled().await;
            }
        }
    }

    fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_id: self.workflow.id.clone(),
            schema_version: STATE_SCHEMA_VERSION,
            variables: self.workflow.variables.clone(),
            started_at: Utc::now(),
        }
    }

    fn run_deadline(&self) -> Option<DateTime<Utc>> {
        let secs = self.workflow.config.timeout_secs?;
        let started = self.state.started_at?;
        Some(started + chrono::Duration::seconds(secs as i64))
    }

    /// Register declared external inputs that are present on disk.
    async fn register_external_inputs(&mut self) -> Result<()> {
        for name in self.workflow.inputs.clone() {
            if self.state.artifact_complete(&name) {
                continue;
            }
            let path = self.project_root.join(name.trim_end_matches('/'));
            if !path.exists() {
                continue;
            }
            let version = self
                .state
                .artifacts
                .get(&name)
                .map(|a| a.version + 1)
                .unwrap_or(1);
            self.append(WorkflowEvent::ArtifactRegistered {
                artifact: Artifact {
                    name: name.clone(),
                    path: name.clone(),
                    status: ArtifactStatus::Complete,
                    created_by: None,
                    created_at: Utc::now(),
                    checksum: None,
                    version,
                },
                at: Utc::now(),
            })
            .await?;
        }
        Ok(())
    }

    /// Resolve inputs and interpolate parameters for one ready step.
    fn prepare_step(&self, step_id: &str) -> Result<PreparedStep> {
        let step = self
            .workflow
            .get_step(step_id)
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?
            .clone();

        let context = RunContext::new(self.state.variables.clone());
        for (name, artifact) in &self.state.artifacts {
            if artifact.status == ArtifactStatus::Complete {
                context.register_artifact(
                    name.clone(),
                    self.project_root.join(&artifact.path).display().to_string(),
                );
            }
        }
        let parameters = context.render_parameters(&step.parameters)?;

        let requires = step
            .requires
            .iter()
            .map(|name| {
                let relative = self
                    .state
                    .artifacts
                    .get(name)
                    .map(|a| a.path.clone())
                    .unwrap_or_else(|| name.clone());
                (name.clone(), self.project_root.join(relative))
            })
            .collect();

        Ok(PreparedStep {
            step,
            parameters,
            requires,
            variables: self.state.variables.clone(),
        })
    }

    /// Apply one outcome to state in the engine's single-writer order.
    async fn ingest(&mut self, outcome: StepOutcome) -> Result<()> {
        let Some(step) = self.workflow.get_step(&outcome.step_id).cloned() else {
            // A panicked task can lose its step attribution.
            self.append(WorkflowEvent::StepFailed {
                execution: outcome.to_execution(),
                at: Utc::now(),
            })
            .await?;
            return Ok(());
        };

        match outcome.status {
            ExecutionStatus::Completed => {
                self.ingest_success(&step, &outcome).await?;
            }
            ExecutionStatus::Failed | ExecutionStatus::Timeout => {
                self.append(WorkflowEvent::StepFailed {
                    execution: outcome.to_execution(),
                    at: Utc::now(),
                })
                .await?;
            }
            ExecutionStatus::Cancelled => {
                self.append(WorkflowEvent::StepCancelled {
                    execution: outcome.to_execution(),
                    at: Utc::now(),
                })
                .await?;
            }
            // The executor never reports these.
            ExecutionStatus::Running | ExecutionStatus::Skipped => {}
        }

        self.write_task_checkpoint(&outcome).await;
        self.maybe_checkpoint(step.is_gate()).await
    }

    /// Record per-task progress under `checkpoints/{task_id}.json`.
    async fn write_task_checkpoint(&self, outcome: &StepOutcome) {
        let checkpoint = TaskCheckpoint::new(
            format!("{}-{}", self.workflow.id, outcome.step_id),
            self.workflow.id.clone(),
            outcome.step_id.clone(),
            serde_json::json!({
                "status": outcome.status,
                "attempts": outcome.attempts,
            }),
            serde_json::json!({
                "metrics": outcome.handler.as_ref().map(|h| h.metrics.clone()),
                "worktree": outcome.worktree_path,
            }),
        );
        if let Err(err) = save_checkpoint(self.store.root(), &checkpoint).await {
            warn!(step_id = %outcome.step_id, %err, "Failed to write task checkpoint");
        }
    }

    async fn ingest_success(&mut self, step: &Step, outcome: &StepOutcome) -> Result<()> {
        let detection = detect_artifacts(&self.project_root, &step.creates, step.checksum);

        if !detection.missing.is_empty() && !step.allow_empty_creates {
            warn!(
                step_id = %step.id,
                missing = ?detection.missing,
                "Step succeeded but declared artifacts are absent"
            );
            let mut execution = outcome.to_execution();
            execution.status = ExecutionStatus::Failed;
            execution.error = Some(ExecutionError::new(
                "artifact_missing",
                format!("declared artifacts not found on disk: {:?}", detection.missing),
            ));
            self.append(WorkflowEvent::StepFailed {
                execution,
                at: Utc::now(),
            })
            .await?;
            return Ok(());
        }

        self.append(WorkflowEvent::StepSucceeded {
            execution: outcome.to_execution(),
            at: Utc::now(),
        })
        .await?;

        for found in &detection.found {
            let previous = self.state.artifacts.get(&found.name);
            let version = previous.map(|a| a.version + 1).unwrap_or(1);
            if let (Some(old), Some(new)) = (
                previous.and_then(|a| a.checksum.as_deref()),
                found.checksum.as_deref(),
            ) {
                if old != new {
                    debug!(artifact = %found.name, "Artifact content changed across loopback");
                }
            }
            self.append(WorkflowEvent::ArtifactRegistered {
                artifact: Artifact {
                    name: found.name.clone(),
                    path: found.name.clone(),
                    status: ArtifactStatus::Complete,
                    created_by: Some(step.id.clone()),
                    created_at: Utc::now(),
                    checksum: found.checksum.clone(),
                    version,
                },
                at: Utc::now(),
            })
            .await?;
        }

        if let Some(thresholds) = step.gate.clone() {
            self.evaluate_gate(step, &thresholds, outcome).await?;
        }
        Ok(())
    }

    async fn evaluate_gate(
        &mut self,
        step: &Step,
        thresholds: &BTreeMap<String, f64>,
        outcome: &StepOutcome,
    ) -> Result<()> {
        let metrics = outcome
            .handler
            .as_ref()
            .map(|h| h.metrics.clone())
            .unwrap_or_default();

        let evaluation = gate::evaluate(thresholds, &metrics);
        if evaluation.passed {
            info!(step_id = %step.id, ?metrics, "Gate passed");
            self.append(WorkflowEvent::GatePassed {
                step_id: step.id.clone(),
                metrics,
                at: Utc::now(),
            })
            .await?;
            return Ok(());
        }

        let count = self.state.loopback_count(&step.id);
        let max = self.workflow.config.max_loopback_iterations;

        if count >= max {
            warn!(step_id = %step.id, count, "Quality gate exhausted");
            self.append(WorkflowEvent::GateFailed {
                step_id: step.id.clone(),
                counter: count,
                failed: evaluation.failed,
                metrics,
                at: Utc::now(),
            })
            .await?;
            self.append(WorkflowEvent::WorkflowFailed {
                error: ExecutionError::new(
                    "quality_gate_exhausted",
                    format!("gate '{}' still failing after {} loopbacks", step.id, count),
                ),
                at: Utc::now(),
            })
            .await?;
            return Ok(());
        }

        let counter = count + 1;
        self.append(WorkflowEvent::GateFailed {
            step_id: step.id.clone(),
            counter,
            failed: evaluation.failed.clone(),
            metrics,
            at: Utc::now(),
        })
        .await?;

        let targets = outcome
            .handler
            .as_ref()
            .map(|h| h.targets_for_improvement.clone())
            .unwrap_or_default();
        let plan = gate::invalidation_plan(&self.graph, step, &targets);
        info!(
            step_id = %step.id,
            counter,
            invalidated = ?plan.steps,
            "Gate failed; looping back"
        );
        self.append(WorkflowEvent::StepsInvalidated {
            gate_id: step.id.clone(),
            step_ids: plan.steps,
            artifact_names: plan.artifacts,
            at: Utc::now(),
        })
        .await?;
        Ok(())
    }

    async fn finish_no_ready(&mut self) -> Result<WorkflowState> {
        let terminals = self.graph.terminal_steps();
        if terminals
            .iter()
            .all(|t| self.state.completed_steps.contains(t))
        {
            self.append(WorkflowEvent::WorkflowCompleted { at: Utc::now() })
                .await?;
            return self.finish().await;
        }

        let failed = self.state.failed_steps.clone();
        let doomed = !failed.is_empty()
            && terminals.iter().all(|t| {
                self.state.completed_steps.contains(t)
                    || failed.contains(t)
                    || self.graph.has_upstream_in(t, &failed)
            });
        if doomed {
            self.append(WorkflowEvent::WorkflowFailed {
                error: ExecutionError::new(
                    "upstream_failure",
                    format!("no surviving path to terminal steps; failed: {failed:?}"),
                ),
                at: Utc::now(),
            })
            .await?;
            return self.finish().await;
        }

        let report = self.graph.diagnose_block(&self.workflow, &self.state);
        warn!(%report, "Workflow blocked");
        self.append(WorkflowEvent::WorkflowBlocked {
            report,
            at: Utc::now(),
        })
        .await?;
        self.finish().await
    }

    async fn finish_cancelled(&mut self) -> Result<WorkflowState> {
        self.append(WorkflowEvent::WorkflowCancelled { at: Utc::now() })
            .await?;
        self.store.clear_cancel(&self.workflow.id).await?;
        self.finish().await
    }

    /// Common exit path: clean sandboxes, checkpoint, persist the report.
    async fn finish(&mut self) -> Result<WorkflowState> {
        self.worktrees.cleanup_all();
        self.checkpoint().await?;

        let report = self.completion_report();
        self.store
            .write_report(&self.workflow.id, &serde_json::to_value(&report)?)
            .await?;

        info!(status = %self.state.status, "Workflow finished");
        Ok(self.state.clone())
    }

    /// Append a durable event, fold it into state, broadcast it, and
    /// refresh the task manifest.
    async fn append(&mut self, event: WorkflowEvent) -> Result<()> {
        let stored = StoredEvent::new(self.state.applied_events + 1, event);
        self.store
            .append_event(&self.workflow.id, &stored)
            .await?;
        self.state.apply(&stored.event);
        self.bus.publish(stored.event);

        if let Err(err) = self.regenerate_manifest().await {
            warn!(%err, "Failed to refresh task manifest");
        }
        Ok(())
    }

    async fn regenerate_manifest(&self) -> Result<()> {
        let plan: Vec<ManifestStep> = self
            .workflow
            .steps
            .iter()
            .map(|step| ManifestStep {
                id: step.id.clone(),
                agent: step.agent.clone(),
                action: step.action.clone(),
                requires: step.requires.clone(),
            })
            .collect();
        let content = render_manifest(&self.state, &plan)?;
        self.store
            .write_manifest(&self.workflow.id, &content)
            .await?;
        Ok(())
    }

    async fn maybe_checkpoint(&mut self, at_gate: bool) -> Result<()> {
        self.steps_since_checkpoint += 1;
        let due = match self.workflow.config.checkpoint {
            CheckpointPolicy::EveryStep => true,
            CheckpointPolicy::EveryN { steps } => self.steps_since_checkpoint >= steps,
            CheckpointPolicy::GateOnly => at_gate,
            CheckpointPolicy::TimeBased { seconds } => {
                self.last_checkpoint.elapsed() >= Duration::from_secs(seconds)
            }
            CheckpointPolicy::Manual => false,
        };
        if due {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Write a snapshot now, regardless of policy.
    pub async fn checkpoint(&mut self) -> Result<()> {
        self.store.write_snapshot(&self.state).await?;
        self.steps_since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
        Ok(())
    }

    /// Aggregate metrics, durations, and the artifact inventory.
    pub fn completion_report(&self) -> CompletionReport {
        let steps = self
            .workflow
            .steps
            .iter()
            .map(|step| {
                let last: Option<&StepExecution> = self.state.last_execution(&step.id);
                let status = if self.state.completed_steps.contains(&step.id) {
                    "completed"
                } else if self.state.failed_steps.contains(&step.id) {
                    "failed"
                } else {
                    "pending"
                };
                StepReport {
                    step_id: step.id.clone(),
                    status: status.to_string(),
                    attempts: last.map(|e| e.attempt).unwrap_or(0),
                    duration_ms: last.map(|e| e.duration.as_millis() as u64).unwrap_or(0),
                    metrics: last.map(|e| e.metrics.clone()).unwrap_or_default(),
                }
            })
            .collect();

        let artifacts = self
            .state
            .artifacts
            .values()
            .map(|artifact| ArtifactReport {
                name: artifact.name.clone(),
                status: format!("{:?}", artifact.status).to_lowercase(),
                version: artifact.version,
                created_by: artifact.created_by.clone(),
            })
            .collect();

        CompletionReport {
            workflow_id: self.workflow.id.clone(),
            status: self.state.status.to_string(),
            started_at: self.state.started_at,
            completed_at: self.state.completed_at,
            steps,
            artifacts,
            loopback_counters: self.state.loopback_counters.clone(),
            error: self.state.error.clone(),
            block_report: self.state.block_report.clone(),
        }
    }
}
