// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Error types for the orchestrator core.

use sdlc_orchestrator_state::{BlockReport, StateStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Classification of handler failures.
///
/// `Transient` failures are retried per policy. `Fatal` marks an unhandled
/// contract violation and cancels the rest of the batch; every other kind
/// terminates only the failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// Temporary failure (tool flake, I/O hiccup); eligible for retry.
    Transient,
    /// Inputs did not satisfy the handler's contract.
    InvalidInput,
    /// Produced output violated the declared schema.
    SchemaViolation,
    /// Handler observed the cancellation signal.
    Cancelled,
    /// Unhandled contract violation; cancels sibling steps.
    Fatal,
}

impl HandlerErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::InvalidInput => "invalid_input",
            Self::SchemaViolation => "schema_violation",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the orchestrator.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Workflow parsing error.
    #[error("Failed to parse workflow: {0}")]
    Parse(String),

    /// Workflow validation error.
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    /// Workflow definition uses a schema version this binary cannot read.
    #[error("Unsupported workflow schema version {0}")]
    UnsupportedSchemaVersion(u32),

    /// Cyclic dependency detected in the artifact graph.
    #[error("Cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A `requires` entry resolves to no step's `creates` and no declared input.
    #[error("Step '{step_id}' requires '{artifact}', which no step creates and no input supplies")]
    DanglingDependency { step_id: String, artifact: String },

    /// Step not found in workflow.
    #[error("Step '{0}' not found in workflow")]
    StepNotFound(String),

    /// No handler registered for the step's agent/action pair.
    #[error("No handler registered for agent '{agent}' action '{action}'")]
    HandlerNotFound { agent: String, action: String },

    /// Classified handler failure.
    #[error("Handler error in step '{step_id}' ({kind}): {message}")]
    Handler {
        step_id: String,
        kind: HandlerErrorKind,
        message: String,
    },

    /// Per-attempt timeout expired.
    #[error("Step '{step_id}' timed out after {duration:?}")]
    Timeout {
        step_id: String,
        duration: std::time::Duration,
    },

    /// Worktree creation or cleanup failed.
    #[error("Worktree error: {0}")]
    Worktree(String),

    /// A step declared artifacts that were not found on disk.
    #[error("Step '{step_id}' did not produce declared artifacts: {missing:?}")]
    ArtifactMissing {
        step_id: String,
        missing: Vec<String>,
    },

    /// A gate kept failing past its loopback bound.
    #[error("Quality gate '{step_id}' exhausted after {iterations} loopbacks")]
    QualityGateExhausted { step_id: String, iterations: u32 },

    /// No step can advance.
    #[error("Workflow blocked:\n{report}")]
    DependencyBlocked { report: BlockReport },

    /// External or sibling-triggered cancellation.
    #[error("Cancelled")]
    Cancelled,

    /// Template rendering error.
    #[error("Template rendering failed: {0}")]
    Template(String),

    /// State persistence error.
    #[error("State persistence error: {0}")]
    State(#[from] StateStoreError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Create a new parse error.
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new validation error.
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new template error.
    pub fn template<S: Into<String>>(msg: S) -> Self {
        Self::Template(msg.into())
    }

    /// Create a generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// Check if the error is retryable.
    ///
    /// Transient handler failures, per-attempt timeouts, and worktree
    /// creation failures may succeed on retry; everything else is terminal
    /// for the attempt envelope.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Worktree(_)
                | Self::Handler {
                    kind: HandlerErrorKind::Transient,
                    ..
                }
        )
    }

    /// Check if the error must cancel sibling steps in the same batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Handler {
                kind: HandlerErrorKind::Fatal,
                ..
            } | Self::State(_)
        )
    }

    /// Configuration-class errors map to the CLI's configuration exit code.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Parse(_)
                | Self::Validation(_)
                | Self::UnsupportedSchemaVersion(_)
                | Self::CyclicDependency { .. }
                | Self::DanglingDependency { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<handlebars::RenderError> for EngineError {
    fn from(err: handlebars::RenderError) -> Self {
        Self::Template(err.to_string())
    }
}
