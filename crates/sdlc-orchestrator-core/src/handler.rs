// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Agent handler contract and registry.
//!
//! Handlers are opaque to the scheduler: the registry resolves an
//! `(agent, action)` pair to a handler object, the executor hands it a
//! context, and gets back artifacts, metrics, and a status. Handlers must
//! confine writes to their worktree (publishing declared artifacts into the
//! project root on success), honor the cancellation token at I/O boundaries,
//! and never touch the state store.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{HandlerErrorKind, Result};

/// Built-in SDLC role identifiers. Adding a new role is a registration, not
/// a type-system extension.
pub const BUILTIN_AGENTS: &[&str] = &[
    "analyst",
    "architect",
    "debugger",
    "designer",
    "documenter",
    "implementer",
    "ops",
    "orchestrator",
    "planner",
    "reviewer",
    "tester",
];

/// Everything a handler gets to see for one step attempt.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub workflow_id: String,
    pub step_id: String,
    pub agent: String,
    pub action: String,
    pub attempt: u32,
    /// Read-only project root; artifact publication target on success.
    pub project_root: PathBuf,
    /// Scratch directory owned by this attempt.
    pub worktree: PathBuf,
    /// Required artifact name -> absolute path.
    pub requires: BTreeMap<String, PathBuf>,
    /// Artifact names (project-relative paths) this step must produce.
    pub creates: Vec<String>,
    /// Step parameters with variables/artifacts already interpolated.
    pub parameters: BTreeMap<String, Value>,
    /// Workflow variables.
    pub variables: BTreeMap<String, Value>,
    /// Observed at every I/O boundary; return promptly when triggered.
    pub cancellation: CancellationToken,
}

/// Handler-reported completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Success,
    Failure,
    Cancelled,
}

/// Classified failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub kind: HandlerErrorKind,
    pub message: String,
}

/// What a handler returns to the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerResult {
    pub status: HandlerStatus,

    /// Artifact name -> path relative to the project root.
    #[serde(default)]
    pub produced: BTreeMap<String, String>,

    /// Numeric quality metrics (e.g. `overall`, `coverage`).
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,

    /// Artifact names a failing gate should send back for rework.
    #[serde(default)]
    pub targets_for_improvement: Vec<String>,

    /// Free-form diagnostics for humans.
    #[serde(default)]
    pub diagnostics: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerFailure>,
}

impl HandlerResult {
    pub fn success() -> Self {
        Self {
            status: HandlerStatus::Success,
            produced: BTreeMap::new(),
            metrics: BTreeMap::new(),
            targets_for_improvement: Vec::new(),
            diagnostics: String::new(),
            error: None,
        }
    }

    pub fn failure(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: HandlerStatus::Failure,
            produced: BTreeMap::new(),
            metrics: BTreeMap::new(),
            targets_for_improvement: Vec::new(),
            diagnostics: String::new(),
            error: Some(HandlerFailure { kind, message }),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: HandlerStatus::Cancelled,
            produced: BTreeMap::new(),
            metrics: BTreeMap::new(),
            targets_for_improvement: Vec::new(),
            diagnostics: String::new(),
            error: None,
        }
    }

    /// Builder-style metric attachment.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Builder-style produced-artifact attachment.
    pub fn with_artifact(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.produced.insert(name.into(), path.into());
        self
    }
}

/// Opaque executor of an `(agent, action)` pair.
///
/// Re-invocation with identical inputs must be safe: the engine offers
/// at-least-once execution and relies on artifact detection for idempotency.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Execute one step attempt.
    async fn execute(&self, context: HandlerContext) -> Result<HandlerResult>;

    /// Handler name for logs.
    fn name(&self) -> &str;
}

/// Dispatch table from `(agent, action)` to handler objects.
///
/// Resolution order: exact `agent/action` registration, then the agent-wide
/// registration, then the fallback (if any).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn AgentHandler>>,
    fallback: RwLock<Option<Arc<dyn AgentHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every action of an agent.
    pub fn register(&self, agent: impl Into<String>, handler: Arc<dyn AgentHandler>) {
        self.handlers.insert(agent.into(), handler);
    }

    /// Register a handler for one specific `(agent, action)` pair.
    pub fn register_action(
        &self,
        agent: &str,
        action: &str,
        handler: Arc<dyn AgentHandler>,
    ) {
        self.handlers.insert(format!("{agent}/{action}"), handler);
    }

    /// Set the fallback used when no agent registration matches.
    pub fn set_fallback(&self, handler: Arc<dyn AgentHandler>) {
        *self.fallback.write() = Some(handler);
    }

    /// Resolve a handler for the pair, if any.
    pub fn resolve(&self, agent: &str, action: &str) -> Option<Arc<dyn AgentHandler>> {
        if let Some(handler) = self.handlers.get(&format!("{agent}/{action}")) {
            return Some(Arc::clone(handler.value()));
        }
        if let Some(handler) = self.handlers.get(agent) {
            return Some(Arc::clone(handler.value()));
        }
        self.fallback.read().clone()
    }

    /// Register the stub handler for every built-in SDLC role.
    ///
    /// Used by the CLI's standalone mode and by tests; real deployments
    /// register their own handlers.
    pub fn with_stub_roles() -> Self {
        let registry = Self::new();
        let stub: Arc<dyn AgentHandler> = Arc::new(StubAgentHandler);
        for agent in BUILTIN_AGENTS {
            registry.register(*agent, Arc::clone(&stub));
        }
        registry
    }
}

/// Placeholder handler: writes a stamp file for every declared artifact and
/// reports metrics taken from the `stub_metrics` parameter.
///
/// Stands in for real agent work in dry runs and tests.
pub struct StubAgentHandler;

#[async_trait]
impl AgentHandler for StubAgentHandler {
    async fn execute(&self, context: HandlerContext) -> Result<HandlerResult> {
        if context.cancellation.is_cancelled() {
            return Ok(HandlerResult::cancelled());
        }

        let mut result = HandlerResult::success();
        for name in &context.creates {
            let target = context.project_root.join(name);
            if name.ends_with('/') || std::path::Path::new(name).extension().is_none() {
                tokio::fs::create_dir_all(&target).await?;
            } else {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let body = format!(
                    "# {name}\n\nproduced by {}/{} (attempt {})\n",
                    context.agent, context.action, context.attempt
                );
                tokio::fs::write(&target, body).await?;
            }
            result.produced.insert(name.clone(), name.clone());
        }

        if let Some(Value::Object(metrics)) = context.parameters.get("stub_metrics") {
            for (name, value) in metrics {
                if let Some(number) = value.as_f64() {
                    result.metrics.insert(name.clone(), number);
                }
            }
        }

        Ok(result)
    }

    fn name(&self) -> &str {
        "stub"
    }
}
