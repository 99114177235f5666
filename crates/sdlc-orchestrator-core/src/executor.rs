// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Parallel batch executor.
//!
//! A batch of ready steps runs as one structured-concurrency scope: a
//! semaphore caps true concurrency, each step gets its own worktree, timeout
//! envelope, and retry loop, and a fatal error (or panic) in one step
//! cancels every in-flight sibling. Ordinary failures are reported
//! individually and never cancel the batch.
//!
//! Results come back in stable order (by step id) regardless of completion
//! order; the engine applies them to state sequentially.

use chrono::{DateTime, Utc};
use sdlc_orchestrator_state::{ExecutionError, ExecutionStatus, StepExecution, WorkflowEvent};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{EngineError, HandlerErrorKind};
use crate::events::EventBus;
use crate::handler::{HandlerContext, HandlerFailure, HandlerRegistry, HandlerResult, HandlerStatus};
use crate::retry::RetryPolicy;
use crate::workflow::Step;
use crate::worktree::WorktreeManager;

/// A ready step with its inputs resolved and parameters interpolated.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub step: Step,
    pub parameters: BTreeMap<String, Value>,
    /// Required artifact name -> absolute path.
    pub requires: BTreeMap<String, PathBuf>,
    pub variables: BTreeMap<String, Value>,
}

/// Final result of one step's attempt envelope.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    /// Attempts consumed (0 when the step never started).
    pub attempts: u32,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub handler: Option<HandlerResult>,
    pub error: Option<ExecutionError>,
    pub worktree_path: Option<String>,
}

impl StepOutcome {
    /// Whether this outcome must cancel the rest of the batch.
    pub fn is_batch_fatal(&self) -> bool {
        self.error
            .as_ref()
            .map(|e| e.kind == HandlerErrorKind::Fatal.as_str())
            .unwrap_or(false)
    }

    /// Convert into the append-only execution record.
    pub fn to_execution(&self) -> StepExecution {
        StepExecution {
            step_id: self.step_id.clone(),
            attempt: self.attempts,
            started_at: self.started_at,
            completed_at: Some(self.completed_at),
            status: self.status,
            duration: self.duration,
            error: self.error.clone(),
            metrics: self
                .handler
                .as_ref()
                .map(|h| h.metrics.clone())
                .unwrap_or_default(),
            worktree_path: self.worktree_path.clone(),
        }
    }
}

/// Structured-concurrency batch runner.
#[derive(Clone)]
pub struct ParallelExecutor {
    workflow_id: String,
    project_root: PathBuf,
    max_parallel: usize,
    default_timeout: Duration,
    default_retry: RetryPolicy,
    registry: Arc<HandlerRegistry>,
    worktrees: Arc<WorktreeManager>,
    bus: EventBus,
}

impl ParallelExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow_id: impl Into<String>,
        project_root: impl Into<PathBuf>,
        max_parallel: usize,
        default_timeout: Duration,
        default_retry: RetryPolicy,
        registry: Arc<HandlerRegistry>,
        worktrees: Arc<WorktreeManager>,
        bus: EventBus,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            project_root: project_root.into(),
            max_parallel,
            default_timeout,
            default_retry,
            registry,
            worktrees,
            bus,
        }
    }

    /// Execute a batch of ready steps.
    ///
    /// Never returns an error: every step failure is captured in its
    /// outcome. A step that raises a fatal error (or panics) cancels the
    /// scope; siblings surface as `cancelled` after their cleanup completes.
    #[instrument(skip(self, batch, cancel), fields(workflow_id = %self.workflow_id, batch_size = batch.len()))]
    pub async fn execute_batch(
        &self,
        batch: Vec<PreparedStep>,
        cancel: &CancellationToken,
    ) -> Vec<StepOutcome> {
        let scope = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks: JoinSet<StepOutcome> = JoinSet::new();
        let mut task_steps: HashMap<tokio::task::Id, String> = HashMap::new();

        for prepared in batch {
            let executor = self.clone();
            let scope = scope.clone();
            let semaphore = Arc::clone(&semaphore);
            let step_id = prepared.step.id.clone();
            let handle = tasks.spawn(async move {
                executor.run_step(prepared, scope, semaphore).await
            });
            task_steps.insert(handle.id(), step_id);
        }

        let mut outcomes = Vec::with_capacity(task_steps.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    task_steps.remove(&id);
                    if outcome.is_batch_fatal() {
                        warn!(step_id = %outcome.step_id, "Fatal step error; cancelling batch");
                        scope.cancel();
                    }
                    outcomes.push(outcome);
                }
                Err(join_error) => {
                    // A panicked step task is fatal to the batch.
                    let step_id = task_steps
                        .remove(&join_error.id())
                        .unwrap_or_else(|| "unknown".to_string());
                    error!(step_id, %join_error, "Step task panicked; cancelling batch");
                    scope.cancel();
                    let now = Utc::now();
                    outcomes.push(StepOutcome {
                        step_id,
                        attempts: 1,
                        status: ExecutionStatus::Failed,
                        started_at: now,
                        completed_at: now,
                        duration: Duration::from_millis(0),
                        handler: None,
                        error: Some(ExecutionError::new(
                            HandlerErrorKind::Fatal.as_str(),
                            format!("step task panicked: {join_error}"),
                        )),
                        worktree_path: None,
                    });
                }
            }
        }

        outcomes.sort_by(|a, b| a.step_id.cmp(&b.step_id));

        self.bus.publish(WorkflowEvent::BatchCompleted {
            step_ids: outcomes.iter().map(|o| o.step_id.clone()).collect(),
            at: Utc::now(),
        });
        outcomes
    }

    /// Per-step envelope: worktree, timeout, handler call, retry evaluation.
    async fn run_step(
        self,
        prepared: PreparedStep,
        cancel: CancellationToken,
        semaphore: Arc<Semaphore>,
    ) -> StepOutcome {
        let step = prepared.step;
        let step_id = step.id.clone();
        let started_at = Utc::now();
        let start = Instant::now();

        // Wait for a concurrency slot.
        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                return self.settle(&step_id, 0, ExecutionStatus::Cancelled, None, None, None, started_at, start);
            }
            permit = semaphore.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return self.settle(
                        &step_id,
                        0,
                        ExecutionStatus::Failed,
                        None,
                        Some(ExecutionError::new(
                            HandlerErrorKind::Fatal.as_str(),
                            "executor semaphore closed",
                        )),
                        None,
                        started_at,
                        start,
                    );
                }
            },
        };

        let Some(handler) = self.registry.resolve(&step.agent, &step.action) else {
            return self.settle(
                &step_id,
                0,
                ExecutionStatus::Failed,
                None,
                Some(ExecutionError::new(
                    HandlerErrorKind::InvalidInput.as_str(),
                    format!(
                        "no handler registered for agent '{}' action '{}'",
                        step.agent, step.action
                    ),
                )),
                None,
                started_at,
                start,
            );
        };

        let retry = step
            .retry
            .as_ref()
            .map(RetryPolicy::from)
            .unwrap_or_else(|| self.default_retry.clone());
        let timeout_after = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let total_attempts = retry.total_attempts();

        let mut attempt = 0u32;
        let mut worktree_path: Option<String> = None;

        loop {
            attempt += 1;

            let worktree = match self.worktrees.acquire(&self.workflow_id, &step_id, attempt) {
                Ok(path) => path,
                Err(err) => {
                    // Hard failure for the step; transient enough to retry,
                    // but never a fallback to the shared project root.
                    if attempt < total_attempts {
                        self.publish_retry(&step_id, attempt + 1, &err.to_string());
                        if !self.backoff(&retry, attempt, &cancel).await {
                            return self.settle(
                                &step_id,
                                attempt,
                                ExecutionStatus::Cancelled,
                                None,
                                None,
                                worktree_path,
                                started_at,
                                start,
                            );
                        }
                        continue;
                    }
                    return self.settle(
                        &step_id,
                        attempt,
                        ExecutionStatus::Failed,
                        None,
                        Some(ExecutionError::new("worktree", err.to_string())),
                        worktree_path,
                        started_at,
                        start,
                    );
                }
            };
            worktree_path = Some(worktree.display().to_string());
            let _worktree_guard = self.worktrees.guard(worktree.clone());

            self.bus.publish(WorkflowEvent::StepStarted {
                step_id: step_id.clone(),
                attempt,
                worktree_path: worktree.display().to_string(),
                started_at: Utc::now(),
            });

            let context = HandlerContext {
                workflow_id: self.workflow_id.clone(),
                step_id: step_id.clone(),
                agent: step.agent.clone(),
                action: step.action.clone(),
                attempt,
                project_root: self.project_root.clone(),
                worktree,
                requires: prepared.requires.clone(),
                creates: step.creates.clone(),
                parameters: prepared.parameters.clone(),
                variables: prepared.variables.clone(),
                cancellation: cancel.clone(),
            };

            enum AttemptEnd {
                Finished(HandlerResult),
                TimedOut,
                Cancelled,
            }

            let end = tokio::select! {
                _ = cancel.cancelled() => AttemptEnd::Cancelled,
                attempted = tokio::time::timeout(timeout_after, handler.execute(context)) => {
                    match attempted {
                        Ok(Ok(result)) => AttemptEnd::Finished(result),
                        Ok(Err(err)) => AttemptEnd::Finished(classify_handler_error(err)),
                        Err(_) => AttemptEnd::TimedOut,
                    }
                }
            };

            match end {
                AttemptEnd::Cancelled => {
                    return self.settle(
                        &step_id,
                        attempt,
                        ExecutionStatus::Cancelled,
                        None,
                        None,
                        worktree_path,
                        started_at,
                        start,
                    );
                }

                AttemptEnd::TimedOut => {
                    if attempt < total_attempts {
                        self.publish_retry(
                            &step_id,
                            attempt + 1,
                            &format!("attempt timed out after {timeout_after:?}"),
                        );
                        if !self.backoff(&retry, attempt, &cancel).await {
                            return self.settle(
                                &step_id,
                                attempt,
                                ExecutionStatus::Cancelled,
                                None,
                                None,
                                worktree_path,
                                started_at,
                                start,
                            );
                        }
                        continue;
                    }
                    return self.settle(
                        &step_id,
                        attempt,
                        ExecutionStatus::Timeout,
                        None,
                        Some(ExecutionError::new(
                            "timeout_after_retries_exhausted",
                            format!(
                                "step timed out after {timeout_after:?} on all {attempt} attempts"
                            ),
                        )),
                        worktree_path,
                        started_at,
                        start,
                    );
                }

                AttemptEnd::Finished(result) => match result.status {
                    HandlerStatus::Success => {
                        info!(step_id = %step_id, attempt, "Step succeeded");
                        return self.settle(
                            &step_id,
                            attempt,
                            ExecutionStatus::Completed,
                            Some(result),
                            None,
                            worktree_path,
                            started_at,
                            start,
                        );
                    }
                    HandlerStatus::Cancelled => {
                        return self.settle(
                            &step_id,
                            attempt,
                            ExecutionStatus::Cancelled,
                            Some(result),
                            None,
                            worktree_path,
                            started_at,
                            start,
                        );
                    }
                    HandlerStatus::Failure => {
                        let failure = result.error.clone().unwrap_or(HandlerFailure {
                            kind: HandlerErrorKind::Fatal,
                            message: "handler reported failure without detail".to_string(),
                        });
                        if failure.kind == HandlerErrorKind::Transient && attempt < total_attempts
                        {
                            self.publish_retry(&step_id, attempt + 1, &failure.message);
                            if !self.backoff(&retry, attempt, &cancel).await {
                                return self.settle(
                                    &step_id,
                                    attempt,
                                    ExecutionStatus::Cancelled,
                                    Some(result),
                                    None,
                                    worktree_path,
                                    started_at,
                                    start,
                                );
                            }
                            continue;
                        }
                        return self.settle(
                            &step_id,
                            attempt,
                            ExecutionStatus::Failed,
                            Some(result),
                            Some(ExecutionError::new(failure.kind.as_str(), failure.message)),
                            worktree_path,
                            started_at,
                            start,
                        );
                    }
                },
            }
        }
    }

    fn publish_retry(&self, step_id: &str, next_attempt: u32, reason: &str) {
        warn!(step_id, next_attempt, reason, "Retrying step");
        self.bus.publish(WorkflowEvent::StepRetrying {
            step_id: step_id.to_string(),
            attempt: next_attempt,
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    /// Sleep out the backoff delay; returns false when cancelled mid-wait.
    async fn backoff(&self, retry: &RetryPolicy, attempt: u32, cancel: &CancellationToken) -> bool {
        let delay = retry.delay_for_attempt(attempt - 1);
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        step_id: &str,
        attempts: u32,
        status: ExecutionStatus,
        handler: Option<HandlerResult>,
        error: Option<ExecutionError>,
        worktree_path: Option<String>,
        started_at: DateTime<Utc>,
        start: Instant,
    ) -> StepOutcome {
        let event = match status {
            ExecutionStatus::Failed | ExecutionStatus::Timeout => Some("step failed"),
            ExecutionStatus::Cancelled => Some("step cancelled"),
            _ => None,
        };
        if let Some(message) = event {
            warn!(step_id, attempts, ?status, "{message}");
        }
        StepOutcome {
            step_id: step_id.to_string(),
            attempts,
            status,
            started_at,
            completed_at: Utc::now(),
            duration: start.elapsed(),
            handler,
            error,
            worktree_path,
        }
    }
}

/// Map an engine-level handler error onto the handler result contract.
fn classify_handler_error(err: EngineError) -> HandlerResult {
    let kind = match &err {
        EngineError::Handler { kind, .. } => *kind,
        EngineError::Cancelled => HandlerErrorKind::Cancelled,
        e if e.is_retryable() => HandlerErrorKind::Transient,
        EngineError::Io(_) => HandlerErrorKind::Transient,
        _ => HandlerErrorKind::Fatal,
    };
    if kind == HandlerErrorKind::Cancelled {
        HandlerResult::cancelled()
    } else {
        HandlerResult::failure(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::AgentHandler;
    use crate::workflow::{BackoffStrategy, RetryConfig, Workflow};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    enum Script {
        Succeed,
        SleepThenSucceed(u64),
        FailTransientTimes(u32),
        FailInvalidInput,
        FailFatal,
        Hang,
    }

    struct TestHandler {
        script: Script,
        calls: AtomicU32,
        live: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl TestHandler {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicU32::new(0),
                live: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl AgentHandler for TestHandler {
        async fn execute(&self, context: HandlerContext) -> crate::error::Result<HandlerResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);

            let result = match &self.script {
                Script::Succeed => HandlerResult::success(),
                Script::SleepThenSucceed(millis) => {
                    tokio::time::sleep(Duration::from_millis(*millis)).await;
                    HandlerResult::success()
                }
                Script::FailTransientTimes(times) => {
                    if call <= *times {
                        HandlerResult::failure(HandlerErrorKind::Transient, "flaky")
                    } else {
                        HandlerResult::success()
                    }
                }
                Script::FailInvalidInput => {
                    HandlerResult::failure(HandlerErrorKind::InvalidInput, "bad input")
                }
                Script::FailFatal => HandlerResult::failure(HandlerErrorKind::Fatal, "broken"),
                Script::Hang => {
                    context.cancellation.cancelled().await;
                    HandlerResult::cancelled()
                }
            };

            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(result)
        }

        fn name(&self) -> &str {
            "test"
        }
    }

    fn workflow(step_ids: &[&str]) -> Workflow {
        let steps = step_ids
            .iter()
            .map(|id| {
                format!(
                    "  - id: \"{id}\"\n    agent: \"implementer\"\n    action: \"build\"\n"
                )
            })
            .collect::<String>();
        Workflow::parse(&format!("id: \"wf\"\nsteps:\n{steps}")).unwrap()
    }

    fn prepared(workflow: &Workflow) -> Vec<PreparedStep> {
        workflow
            .steps
            .iter()
            .map(|step| PreparedStep {
                step: step.clone(),
                parameters: BTreeMap::new(),
                requires: BTreeMap::new(),
                variables: BTreeMap::new(),
            })
            .collect()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: ParallelExecutor,
    }

    fn fixture(registry: HandlerRegistry, max_parallel: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let worktrees =
            Arc::new(WorktreeManager::new(dir.path().join("worktrees")).unwrap());
        let executor = ParallelExecutor::new(
            "wf",
            dir.path(),
            max_parallel,
            Duration::from_millis(500),
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                multiplier: 2.0,
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            Arc::new(registry),
            worktrees,
            EventBus::new(),
        );
        Fixture {
            _dir: dir,
            executor,
        }
    }

    #[tokio::test]
    async fn test_results_sorted_by_step_id() {
        let registry = HandlerRegistry::new();
        registry.register("implementer", TestHandler::new(Script::SleepThenSucceed(10)));
        let fixture = fixture(registry, 8);

        let workflow = workflow(&["zeta", "alpha", "mid"]);
        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.step_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert!(outcomes
            .iter()
            .all(|o| o.status == ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn test_semaphore_caps_concurrency() {
        let handler = TestHandler::new(Script::SleepThenSucceed(20));
        let peak = Arc::clone(&handler.peak);
        let registry = HandlerRegistry::new();
        registry.register("implementer", handler);
        let fixture = fixture(registry, 2);

        let workflow = workflow(&["a", "b", "c", "d", "e", "f"]);
        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let handler = TestHandler::new(Script::FailTransientTimes(2));
        let registry = HandlerRegistry::new();
        registry.register("implementer", Arc::clone(&handler) as Arc<dyn AgentHandler>);
        let fixture = fixture(registry, 8);

        let workflow = workflow(&["flaky"]);
        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;

        assert_eq!(outcomes[0].status, ExecutionStatus::Completed);
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_input_does_not_retry() {
        let handler = TestHandler::new(Script::FailInvalidInput);
        let registry = HandlerRegistry::new();
        registry.register("implementer", Arc::clone(&handler) as Arc<dyn AgentHandler>);
        let fixture = fixture(registry, 8);

        let workflow = workflow(&["strict"]);
        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;

        assert_eq!(outcomes[0].status, ExecutionStatus::Failed);
        assert_eq!(outcomes[0].attempts, 1);
        assert_eq!(outcomes[0].error.as_ref().unwrap().kind, "invalid_input");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_exhausts_retries() {
        let registry = HandlerRegistry::new();
        registry.register("implementer", TestHandler::new(Script::Hang));
        let mut fixture = fixture(registry, 8);
        fixture.executor.default_timeout = Duration::from_millis(20);

        let mut workflow = workflow(&["slow"]);
        workflow.steps[0].retry = Some(RetryConfig {
            max_attempts: 1,
            backoff: BackoffStrategy::Constant,
            initial_delay_ms: 1,
            max_delay_ms: 1,
        });

        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;

        assert_eq!(outcomes[0].status, ExecutionStatus::Timeout);
        assert_eq!(outcomes[0].attempts, 2);
        assert_eq!(
            outcomes[0].error.as_ref().unwrap().kind,
            "timeout_after_retries_exhausted"
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails_step() {
        let fixture = fixture(HandlerRegistry::new(), 8);
        let workflow = workflow(&["orphan"]);

        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;

        assert_eq!(outcomes[0].status, ExecutionStatus::Failed);
        assert_eq!(outcomes[0].error.as_ref().unwrap().kind, "invalid_input");
    }

    #[tokio::test]
    async fn test_external_cancellation_cancels_batch() {
        let registry = HandlerRegistry::new();
        registry.register("implementer", TestHandler::new(Script::Hang));
        let fixture = fixture(registry, 8);

        let workflow = workflow(&["a", "b"]);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &cancel)
            .await;

        assert!(outcomes
            .iter()
            .all(|o| o.status == ExecutionStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_fatal_error_cancels_siblings() {
        let registry = HandlerRegistry::new();
        registry.register_action("implementer", "explode", TestHandler::new(Script::FailFatal));
        registry.register("implementer", TestHandler::new(Script::Hang));
        let fixture = fixture(registry, 8);

        let mut workflow = workflow(&["patient", "volatile"]);
        workflow.steps[1].action = "explode".to_string();

        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;

        let patient = outcomes.iter().find(|o| o.step_id == "patient").unwrap();
        let volatile = outcomes.iter().find(|o| o.step_id == "volatile").unwrap();
        assert_eq!(volatile.status, ExecutionStatus::Failed);
        assert!(volatile.is_batch_fatal());
        assert_eq!(patient.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_worktrees_released_on_all_paths() {
        let registry = HandlerRegistry::new();
        registry.register("implementer", TestHandler::new(Script::Succeed));
        registry.register_action("implementer", "reject", TestHandler::new(Script::FailInvalidInput));
        let fixture = fixture(registry, 8);

        let mut workflow = workflow(&["good", "bad"]);
        workflow.steps[1].action = "reject".to_string();

        let outcomes = fixture
            .executor
            .execute_batch(prepared(&workflow), &CancellationToken::new())
            .await;
        assert_eq!(outcomes.len(), 2);

        let mut leftover = std::fs::read_dir(fixture.executor.worktrees.root())
            .unwrap()
            .flatten();
        assert!(leftover.next().is_none());
    }
}
