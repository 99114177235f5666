// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! End-to-end engine tests: linear pipelines, parallel fan-out, quality
//! loopback, blocked workflows, cancellation, and crash recovery.

use async_trait::async_trait;
use chrono::Utc;
use sdlc_orchestrator_core::{
    AgentHandler, HandlerContext, HandlerRegistry, HandlerResult, Workflow, WorkflowEngine,
};
use sdlc_orchestrator_state::{
    Artifact, ArtifactStatus, ExecutionStatus, FileStateStore, StepExecution, StoredEvent,
    WorkflowEvent, WorkflowState, WorkflowStatus, STATE_SCHEMA_VERSION,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reviewer that reports a scripted sequence of `overall` scores.
struct SequenceReviewer {
    scores: Mutex<Vec<f64>>,
}

impl SequenceReviewer {
    fn new(scores: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            scores: Mutex::new(scores),
        })
    }
}

#[async_trait]
impl AgentHandler for SequenceReviewer {
    async fn execute(
        &self,
        _context: HandlerContext,
    ) -> sdlc_orchestrator_core::Result<HandlerResult> {
        let mut scores = self.scores.lock().unwrap();
        let score = if scores.len() > 1 {
            scores.remove(0)
        } else {
            scores.first().copied().unwrap_or(0.0)
        };
        Ok(HandlerResult::success().with_metric("overall", score))
    }

    fn name(&self) -> &str {
        "sequence-reviewer"
    }
}

/// Handler that parks until cancelled.
struct HangHandler;

#[async_trait]
impl AgentHandler for HangHandler {
    async fn execute(
        &self,
        context: HandlerContext,
    ) -> sdlc_orchestrator_core::Result<HandlerResult> {
        context.cancellation.cancelled().await;
        Ok(HandlerResult::cancelled())
    }

    fn name(&self) -> &str {
        "hang"
    }
}

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        Self { dir }
    }

    fn project_root(&self) -> std::path::PathBuf {
        self.dir.path().join("project")
    }

    fn store(&self) -> FileStateStore {
        FileStateStore::new(self.dir.path().join("state"))
    }

    fn engine(&self, yaml: &str, registry: HandlerRegistry) -> WorkflowEngine {
        let workflow = Workflow::parse(yaml).unwrap();
        WorkflowEngine::new(
            workflow,
            self.project_root(),
            self.store(),
            Arc::new(registry),
        )
        .unwrap()
    }

    fn stub_engine(&self, yaml: &str) -> WorkflowEngine {
        self.engine(yaml, HandlerRegistry::with_stub_roles())
    }
}

fn executions_of<'a>(state: &'a WorkflowState, step_id: &str) -> Vec<&'a StepExecution> {
    state
        .step_executions
        .iter()
        .filter(|e| e.step_id == step_id)
        .collect()
}

const LINEAR: &str = r#"
id: "linear"
steps:
  - id: "a"
    agent: "analyst"
    action: "gather"
    creates: ["req.md"]
  - id: "b"
    agent: "architect"
    action: "design"
    requires: ["req.md"]
    creates: ["arch.md"]
  - id: "c"
    agent: "implementer"
    action: "build"
    requires: ["arch.md"]
    creates: ["src"]
"#;

#[tokio::test]
async fn linear_pipeline_completes() {
    let fixture = Fixture::new();
    let mut engine = fixture.stub_engine(LINEAR);

    let state = engine.run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let completed: Vec<&str> = state.completed_steps.iter().map(String::as_str).collect();
    assert_eq!(completed, vec!["a", "b", "c"]);
    for name in ["req.md", "arch.md", "src"] {
        assert_eq!(state.artifacts[name].status, ArtifactStatus::Complete);
    }
    assert!(state.loopback_counters.values().all(|count| *count == 0));
    assert!(fixture.project_root().join("src").is_dir());
}

const FAN_OUT: &str = r#"
id: "fan-out"
config:
  max_parallel: 3
steps:
  - id: "p"
    agent: "planner"
    action: "plan"
    creates: ["spec"]
  - id: "q1"
    agent: "implementer"
    action: "build"
    requires: ["spec"]
    creates: ["a.md"]
  - id: "q2"
    agent: "implementer"
    action: "build"
    requires: ["spec"]
    creates: ["b.md"]
  - id: "q3"
    agent: "implementer"
    action: "build"
    requires: ["spec"]
    creates: ["c.md"]
  - id: "r"
    agent: "ops"
    action: "bundle"
    requires: ["a.md", "b.md", "c.md"]
    creates: ["bundle.md"]
"#;

#[tokio::test]
async fn parallel_fan_out_joins_after_all_branches() {
    let fixture = Fixture::new();
    let mut engine = fixture.stub_engine(FAN_OUT);

    let state = engine.run().await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.completed_steps.len(), 5);

    let join_started = executions_of(&state, "r")[0].started_at;
    for branch in ["q1", "q2", "q3"] {
        let finished = executions_of(&state, branch)[0].completed_at.unwrap();
        assert!(
            join_started >= finished,
            "join started before branch {branch} finished"
        );
    }
}

fn gated_yaml() -> &'static str {
    r#"
id: "gated"
steps:
  - id: "i"
    agent: "implementer"
    action: "write_code"
    creates: ["src"]
  - id: "g"
    agent: "reviewer"
    action: "score"
    requires: ["src"]
    gate:
      overall: 70
"#
}

fn gated_registry(scores: Vec<f64>) -> HandlerRegistry {
    let registry = HandlerRegistry::with_stub_roles();
    registry.register("reviewer", SequenceReviewer::new(scores));
    registry
}

#[tokio::test]
async fn quality_loopback_reruns_producer_then_passes() {
    let fixture = Fixture::new();
    let mut engine = fixture.engine(gated_yaml(), gated_registry(vec![55.0, 80.0]));

    let state = engine.run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.loopback_counters["g"], 1);
    assert_eq!(executions_of(&state, "i").len(), 2);
    assert_eq!(executions_of(&state, "g").len(), 2);

    // The event log shows both gate evaluations.
    let events = fixture.store().read_events("gated", 0).await.unwrap();
    let gate_events: Vec<&str> = events
        .iter()
        .map(|e| e.event.event_type())
        .filter(|t| t.starts_with("gate_"))
        .collect();
    assert_eq!(gate_events, vec!["gate_failed", "gate_passed"]);

    // Superseded artifact carries a bumped version.
    assert_eq!(state.artifacts["src"].version, 2);
}

#[tokio::test]
async fn loopback_exhaustion_fails_workflow() {
    let fixture = Fixture::new();
    let mut engine = fixture.engine(gated_yaml(), gated_registry(vec![55.0]));

    let state = engine.run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.error.as_ref().unwrap().kind, "quality_gate_exhausted");
    assert_eq!(state.loopback_counters["g"], 3);

    // Bounded loopback: no step ran more than max_loopback_iterations + 1
    // times.
    assert_eq!(executions_of(&state, "i").len(), 4);
    assert_eq!(executions_of(&state, "g").len(), 4);
}

#[tokio::test]
async fn missing_external_input_blocks_with_diagnosis() {
    let fixture = Fixture::new();
    let yaml = r#"
id: "needs-input"
inputs: ["x"]
steps:
  - id: "b"
    agent: "implementer"
    action: "build"
    requires: ["x"]
    creates: ["out.md"]
"#;
    let mut engine = fixture.stub_engine(yaml);
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Blocked);
    let report = state.block_report.as_ref().unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].step_id, "b");
    assert_eq!(report.entries[0].missing, vec!["x"]);
}

#[tokio::test]
async fn blocked_workflow_resumes_once_input_appears() {
    let fixture = Fixture::new();
    let yaml = r#"
id: "late-input"
inputs: ["x"]
steps:
  - id: "b"
    agent: "implementer"
    action: "build"
    requires: ["x"]
    creates: ["out.md"]
"#;

    let blocked = fixture.stub_engine(yaml).run().await.unwrap();
    assert_eq!(blocked.status, WorkflowStatus::Blocked);

    // Operator supplies the input and resumes.
    std::fs::write(fixture.project_root().join("x"), b"seed").unwrap();
    let state = fixture.stub_engine(yaml).run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert!(state.artifact_complete("x"));
    assert!(state.artifact_complete("out.md"));
    assert!(state.artifacts["x"].created_by.is_none());
}

#[tokio::test]
async fn upstream_failure_fails_workflow() {
    let fixture = Fixture::new();
    let yaml = r#"
id: "doomed"
steps:
  - id: "a"
    agent: "analyst"
    action: "gather"
    creates: ["req.md"]
    allow_empty_creates: false
  - id: "b"
    agent: "architect"
    action: "design"
    requires: ["req.md"]
    creates: ["arch.md"]
"#;
    // The analyst "succeeds" without producing req.md, which the engine
    // converts into an artifact_missing failure.
    let registry = HandlerRegistry::new();
    struct EmptyHandler;
    #[async_trait]
    impl AgentHandler for EmptyHandler {
        async fn execute(
            &self,
            _context: HandlerContext,
        ) -> sdlc_orchestrator_core::Result<HandlerResult> {
            Ok(HandlerResult::success())
        }
        fn name(&self) -> &str {
            "empty"
        }
    }
    registry.register("analyst", Arc::new(EmptyHandler));

    let mut engine = fixture.engine(yaml, registry);
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.error.as_ref().unwrap().kind, "upstream_failure");
    assert!(state.failed_steps.contains("a"));
    let failed = executions_of(&state, "a");
    assert_eq!(failed[0].error.as_ref().unwrap().kind, "artifact_missing");
}

#[tokio::test]
async fn crash_recovery_replays_events_past_snapshot() {
    let fixture = Fixture::new();
    let store = fixture.store();
    let workflow = Workflow::parse(LINEAR).unwrap();

    // Hand-build the on-disk state of an engine killed after step b's
    // events were appended but before the next snapshot.
    let mut state = WorkflowState::empty();
    state.workflow_id = "linear".to_string();
    store.init_workflow(&state).await.unwrap();
    store
        .write_definition("linear", &serde_yaml::to_string(&workflow).unwrap())
        .await
        .unwrap();

    let mut seq = 0u64;
    let mut append = |event: WorkflowEvent, state: &mut WorkflowState| {
        seq += 1;
        let stored = StoredEvent::new(seq, event);
        state.apply(&stored.event);
        stored
    };

    fn succeeded(step_id: &str) -> WorkflowEvent {
        WorkflowEvent::StepSucceeded {
            execution: StepExecution {
                step_id: step_id.to_string(),
                attempt: 1,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                status: ExecutionStatus::Completed,
                duration: Duration::from_millis(3),
                error: None,
                metrics: BTreeMap::new(),
                worktree_path: None,
            },
            at: Utc::now(),
        }
    }
    fn registered(name: &str, created_by: &str) -> WorkflowEvent {
        WorkflowEvent::ArtifactRegistered {
            artifact: Artifact {
                name: name.to_string(),
                path: name.to_string(),
                status: ArtifactStatus::Complete,
                created_by: Some(created_by.to_string()),
                created_at: Utc::now(),
                checksum: None,
                version: 1,
            },
            at: Utc::now(),
        }
    }

    let started = append(
        WorkflowEvent::WorkflowStarted {
            workflow_id: "linear".to_string(),
            schema_version: STATE_SCHEMA_VERSION,
            variables: BTreeMap::new(),
            started_at: Utc::now(),
        },
        &mut state,
    );
    store.append_event("linear", &started).await.unwrap();
    let a_done = append(succeeded("a"), &mut state);
    store.append_event("linear", &a_done).await.unwrap();
    let a_artifact = append(registered("req.md", "a"), &mut state);
    store.append_event("linear", &a_artifact).await.unwrap();

    // Snapshot covers only up to step a.
    store.write_snapshot(&state).await.unwrap();

    // Step b's events landed in the log after that snapshot.
    let b_done = append(succeeded("b"), &mut state);
    store.append_event("linear", &b_done).await.unwrap();
    let b_artifact = append(registered("arch.md", "b"), &mut state);
    store.append_event("linear", &b_artifact).await.unwrap();

    std::fs::write(fixture.project_root().join("req.md"), b"req").unwrap();
    std::fs::write(fixture.project_root().join("arch.md"), b"arch").unwrap();

    // Resume: b must appear completed, only c runs.
    let mut engine = fixture.stub_engine(LINEAR);
    let final_state = engine.run().await.unwrap();

    assert_eq!(final_state.status, WorkflowStatus::Completed);
    assert!(final_state.completed_steps.contains("b"));
    assert_eq!(executions_of(&final_state, "a").len(), 1);
    assert_eq!(executions_of(&final_state, "b").len(), 1);
    assert_eq!(executions_of(&final_state, "c").len(), 1);
}

#[tokio::test]
async fn replaying_full_log_reproduces_final_snapshot() {
    let fixture = Fixture::new();
    let mut engine = fixture.stub_engine(LINEAR);
    engine.run().await.unwrap();

    let store = fixture.store();
    let snapshot = store.read_snapshot("linear").await.unwrap();

    let mut replayed = WorkflowState::empty();
    for stored in store.read_events("linear", 0).await.unwrap() {
        replayed.apply(&stored.event);
    }

    assert_eq!(replayed, snapshot);
}

#[tokio::test]
async fn cancellation_stops_run_and_cleans_worktrees() {
    let fixture = Fixture::new();
    let registry = HandlerRegistry::new();
    registry.register("implementer", Arc::new(HangHandler));

    let yaml = r#"
id: "cancellable"
steps:
  - id: "forever"
    agent: "implementer"
    action: "spin"
    creates: ["out.md"]
    allow_empty_creates: true
"#;
    let mut engine = fixture.engine(yaml, registry);
    let token = engine.cancel_token();

    let handle = tokio::spawn(async move { engine.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let state = handle.await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);

    // The cancelled step is recorded but neither completed nor failed.
    assert!(state.completed_steps.is_empty());
    assert!(state.failed_steps.is_empty());
    assert_eq!(
        executions_of(&state, "forever")[0].status,
        ExecutionStatus::Cancelled
    );

    // No sandbox survives.
    let worktree_root = fixture
        .dir
        .path()
        .join("state")
        .join("worktrees")
        .join("cancellable");
    assert!(no_dirs_under(&worktree_root));
}

fn no_dirs_under(root: &Path) -> bool {
    match std::fs::read_dir(root) {
        Ok(entries) => entries.flatten().all(|e| !e.path().is_dir()),
        Err(_) => true,
    }
}

#[tokio::test]
async fn variables_flow_into_handler_parameters() {
    let fixture = Fixture::new();

    struct CaptureHandler {
        seen: Mutex<Option<serde_json::Value>>,
    }
    #[async_trait]
    impl AgentHandler for CaptureHandler {
        async fn execute(
            &self,
            context: HandlerContext,
        ) -> sdlc_orchestrator_core::Result<HandlerResult> {
            *self.seen.lock().unwrap() = context.parameters.get("goal").cloned();
            Ok(HandlerResult::success())
        }
        fn name(&self) -> &str {
            "capture"
        }
    }

    let capture = Arc::new(CaptureHandler {
        seen: Mutex::new(None),
    });
    let registry = HandlerRegistry::new();
    registry.register("analyst", Arc::clone(&capture) as Arc<dyn AgentHandler>);

    let yaml = r#"
id: "templated"
variables:
  service: "payments"
steps:
  - id: "a"
    agent: "analyst"
    action: "gather"
    parameters:
      goal: "analyze {{ variables.service }}"
    allow_empty_creates: true
"#;
    let mut engine = fixture.engine(yaml, registry);
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(
        capture.seen.lock().unwrap().clone().unwrap(),
        serde_json::json!("analyze payments")
    );
}

#[tokio::test]
async fn goto_target_controls_loopback_scope() {
    let fixture = Fixture::new();
    let yaml = r#"
id: "routed"
steps:
  - id: "plan"
    agent: "planner"
    action: "plan"
    creates: ["plan.md"]
  - id: "implement"
    agent: "implementer"
    action: "build"
    requires: ["plan.md"]
    creates: ["src"]
  - id: "review"
    agent: "reviewer"
    action: "score"
    requires: ["src"]
    gate:
      overall: 70
    on_gate_fail_goto: "plan"
"#;
    let mut engine = fixture.engine(yaml, gated_registry(vec![40.0, 90.0]));
    let state = engine.run().await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.loopback_counters["review"], 1);
    // The loopback re-ran the goto target and everything downstream.
    assert_eq!(executions_of(&state, "plan").len(), 2);
    assert_eq!(executions_of(&state, "implement").len(), 2);
    assert_eq!(executions_of(&state, "review").len(), 2);
}
