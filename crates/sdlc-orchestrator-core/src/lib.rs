// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! SDLC Orchestrator Core - workflow orchestration for agent-executed
//! software-development pipelines.
//!
//! This crate parses declarative YAML workflows (directed graphs of steps
//! with artifact dependencies and quality gates) and drives them to
//! completion: dependency-based scheduling with bounded parallelism,
//! worktree isolation, durable event-sourced state, and bounded
//! quality-gate loopback. The core never calls a model; it dispatches
//! opaque agent handlers.
//!
//! # Example
//!
//! ```rust
//! use sdlc_orchestrator_core::Workflow;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let yaml = r#"
//! id: "build-service"
//! steps:
//!   - id: "analyze"
//!     agent: "analyst"
//!     action: "gather_requirements"
//!     creates: ["requirements.md"]
//!   - id: "design"
//!     agent: "architect"
//!     action: "draft_architecture"
//!     requires: ["requirements.md"]
//!     creates: ["architecture.md"]
//! "#;
//!
//! let workflow = Workflow::parse(yaml)?;
//! assert_eq!(workflow.steps.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod context;
pub mod dag;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod gate;
pub mod handler;
pub mod retry;
pub mod workflow;
pub mod worktree;

// Re-export commonly used types
pub use context::RunContext;
pub use dag::DependencyGraph;
pub use engine::{CompletionReport, WorkflowEngine};
pub use error::{EngineError, HandlerErrorKind, Result};
pub use events::EventBus;
pub use executor::{ParallelExecutor, PreparedStep, StepOutcome};
pub use handler::{
    AgentHandler, HandlerContext, HandlerRegistry, HandlerResult, HandlerStatus, StubAgentHandler,
    BUILTIN_AGENTS,
};
pub use retry::RetryPolicy;
pub use workflow::{
    BackoffStrategy, CheckpointPolicy, InvalidateMode, RetryConfig, Step, Workflow,
    WorkflowConfig, DEFINITION_SCHEMA_VERSION,
};
pub use worktree::WorktreeManager;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
