// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! SDLC Orchestrator CLI.
//!
//! Exit codes: 0 completed, 1 failed, 2 blocked, 3 cancelled,
//! 4 configuration error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use sdlc_orchestrator_core::{EngineError, HandlerRegistry, Workflow, WorkflowEngine};
use sdlc_orchestrator_state::{FileStateStore, WorkflowState, WorkflowStatus};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_COMPLETED: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_BLOCKED: i32 = 2;
const EXIT_CANCELLED: i32 = 3;
const EXIT_CONFIGURATION: i32 = 4;

#[derive(Parser)]
#[command(name = "sdlc-orchestrator")]
#[command(version, about = "SDLC Workflow Orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// State root directory (overrides SDLC_STATE_ROOT)
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition without executing it
    Validate {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Start a new workflow
    Run {
        /// Path to workflow file
        #[arg(value_name = "FILE")]
        file: String,

        /// Project root handlers read from and publish artifacts into
        #[arg(long, default_value = ".")]
        project_root: PathBuf,

        /// Extra variables as a JSON object (or a path to a JSON file)
        #[arg(short, long)]
        input: Option<String>,

        /// Override the workflow's max_parallel setting
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Reload a workflow's state and continue it
    Resume {
        /// Workflow id (defaults to the most recent one)
        workflow_id: Option<String>,

        /// Project root handlers read from and publish artifacts into
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
    },

    /// Print a workflow's snapshot summary and block diagnosis
    Status {
        /// Workflow id (defaults to the most recent one)
        workflow_id: Option<String>,
    },

    /// Request cancellation of a running workflow
    Cancel {
        /// Workflow id
        workflow_id: String,
    },

    /// List workflows under the state root
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let debug_env = std::env::var("SDLC_DEBUG").map(|v| v == "1").unwrap_or(false);
    let log_level = if cli.verbose || debug_env {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sdlc_orchestrator={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = FileStateStore::new(state_root(cli.state_root.clone()));

    let code = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run {
            file,
            project_root,
            input,
            max_parallel,
        } => run_workflow(&store, &file, project_root, input.as_deref(), max_parallel).await,
        Commands::Resume {
            workflow_id,
            project_root,
        } => resume_workflow(&store, workflow_id, project_root).await,
        Commands::Status { workflow_id } => show_status(&store, workflow_id).await,
        Commands::Cancel { workflow_id } => cancel_workflow(&store, &workflow_id).await,
        Commands::List => list_workflows(&store).await,
    };

    let code = code.unwrap_or_else(|e| {
        error!("{e:#}");
        eprintln!("{} {e:#}", "Error:".red().bold());
        exit_code_for_error(&e)
    });
    std::process::exit(code);
}

fn state_root(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("SDLC_STATE_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".sdlc"))
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(engine_err) if engine_err.is_configuration() => EXIT_CONFIGURATION,
        _ => EXIT_FAILED,
    }
}

fn exit_code_for_status(status: WorkflowStatus) -> i32 {
    match status {
        WorkflowStatus::Completed | WorkflowStatus::Paused => EXIT_COMPLETED,
        WorkflowStatus::Blocked => EXIT_BLOCKED,
        WorkflowStatus::Cancelled => EXIT_CANCELLED,
        _ => EXIT_FAILED,
    }
}

fn validate_workflow(file_path: &str) -> Result<i32> {
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);

    let content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read workflow file: {}", file_path))?;
    let workflow = Workflow::parse(&content)?;

    println!("{}", "✓ Workflow is valid".green().bold());
    println!("  Id: {}", workflow.id);
    println!("  Version: {}", workflow.version);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Max parallel: {}", workflow.config.max_parallel);
    Ok(EXIT_COMPLETED)
}

async fn run_workflow(
    store: &FileStateStore,
    file_path: &str,
    project_root: PathBuf,
    input: Option<&str>,
    max_parallel: Option<usize>,
) -> Result<i32> {
    println!("{} {}", "Running workflow:".cyan().bold(), file_path);

    let content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read workflow file: {}", file_path))?;
    let mut workflow = Workflow::parse(&content)?;

    if let Some(max) = max_parallel {
        workflow.config.max_parallel = max;
    }
    if let Some(input) = input {
        for (key, value) in parse_input(input)? {
            workflow.variables.insert(key, value);
        }
    }

    info!(workflow_id = %workflow.id, "Parsed workflow");
    execute(store, workflow, project_root).await
}

async fn resume_workflow(
    store: &FileStateStore,
    workflow_id: Option<String>,
    project_root: PathBuf,
) -> Result<i32> {
    let workflow_id = resolve_id(store, workflow_id).await?;
    println!("{} {}", "Resuming workflow:".cyan().bold(), workflow_id);

    let yaml = store
        .read_definition(&workflow_id)
        .await
        .with_context(|| format!("No stored definition for workflow '{}'", workflow_id))?;
    let workflow = Workflow::parse(&yaml)?;

    execute(store, workflow, project_root).await
}

async fn execute(
    store: &FileStateStore,
    workflow: Workflow,
    project_root: PathBuf,
) -> Result<i32> {
    // Standalone mode runs the placeholder handlers for the built-in SDLC
    // roles; embedders register real ones through the library API.
    let registry = Arc::new(HandlerRegistry::with_stub_roles());

    let mut engine = WorkflowEngine::new(workflow, project_root, store.clone(), registry)?;
    let state = engine.run().await?;

    print_state(&state);
    Ok(exit_code_for_status(state.status))
}

async fn show_status(store: &FileStateStore, workflow_id: Option<String>) -> Result<i32> {
    let workflow_id = resolve_id(store, workflow_id).await?;
    let state = store
        .read_snapshot(&workflow_id)
        .await
        .with_context(|| format!("No state for workflow '{}'", workflow_id))?;

    print_state(&state);
    Ok(EXIT_COMPLETED)
}

async fn cancel_workflow(store: &FileStateStore, workflow_id: &str) -> Result<i32> {
    store.request_cancel(workflow_id).await?;
    println!(
        "{} cancellation requested for '{}'",
        "✓".green().bold(),
        workflow_id
    );
    println!("  The engine honors it at the next batch boundary.");
    Ok(EXIT_COMPLETED)
}

async fn list_workflows(store: &FileStateStore) -> Result<i32> {
    let summaries = store.list().await?;
    if summaries.is_empty() {
        println!("No workflows under {}", store.root().display());
        return Ok(EXIT_COMPLETED);
    }

    println!(
        "{:<24} {:<11} {:>9} {:>7}",
        "WORKFLOW".bold(),
        "STATUS".bold(),
        "COMPLETED".bold(),
        "FAILED".bold()
    );
    for summary in summaries {
        println!(
            "{:<24} {:<11} {:>9} {:>7}",
            summary.workflow_id,
            paint_status(summary.status),
            summary.completed_steps,
            summary.failed_steps
        );
    }
    Ok(EXIT_COMPLETED)
}

async fn resolve_id(store: &FileStateStore, workflow_id: Option<String>) -> Result<String> {
    if let Some(id) = workflow_id {
        return Ok(id);
    }
    store
        .last()
        .await?
        .map(|pointer| pointer.workflow_id)
        .context("No workflows found; pass a workflow id")
}

fn parse_input(input: &str) -> Result<BTreeMap<String, serde_json::Value>> {
    let content = if std::path::Path::new(input).exists() {
        fs::read_to_string(input)
            .with_context(|| format!("Failed to read input file: {}", input))?
    } else {
        input.to_string()
    };
    serde_json::from_str(&content).context("Input must be a JSON object of variables")
}

fn paint_status(status: WorkflowStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        WorkflowStatus::Completed => text.green(),
        WorkflowStatus::Running | WorkflowStatus::Initialized => text.cyan(),
        WorkflowStatus::Paused => text.yellow(),
        WorkflowStatus::Blocked => text.yellow(),
        WorkflowStatus::Failed => text.red(),
        WorkflowStatus::Cancelled => text.magenta(),
    }
}

fn print_state(state: &WorkflowState) {
    println!();
    println!(
        "{} {} — {}",
        "Workflow".bold(),
        state.workflow_id,
        paint_status(state.status).bold()
    );
    println!(
        "  Steps: {} completed, {} failed",
        state.completed_steps.len(),
        state.failed_steps.len()
    );

    if !state.artifacts.is_empty() {
        println!("  Artifacts:");
        for artifact in state.artifacts.values() {
            println!(
                "    {} ({:?}, v{})",
                artifact.name, artifact.status, artifact.version
            );
        }
    }

    if !state.loopback_counters.is_empty() {
        println!("  Loopbacks:");
        for (step_id, count) in &state.loopback_counters {
            println!("    {}: {}", step_id, count);
        }
    }

    if let Some(error) = &state.error {
        println!("  {} [{}] {}", "Error:".red().bold(), error.kind, error.message);
    }

    if let Some(report) = &state.block_report {
        println!("  {}", "Outstanding requirements:".yellow().bold());
        for entry in &report.entries {
            println!("    [{}: missing {:?}]", entry.step_id, entry.missing);
        }
    }
}
