// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Workflow definition types.
//!
//! The YAML definition format is the only source of truth, so every struct
//! rejects unknown fields. Older schema versions are migrated forward before
//! the strict parse; unknown versions are refused.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::error::{EngineError, Result};

/// Current workflow definition schema version.
pub const DEFINITION_SCHEMA_VERSION: u32 = 2;

/// A complete workflow definition, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Unique workflow identifier.
    pub id: String,

    /// Definition schema version.
    #[serde(default = "default_schema_version")]
    pub version: u32,

    /// Description of what this workflow does.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Global execution configuration.
    #[serde(default)]
    pub config: WorkflowConfig,

    /// Externally-supplied input artifacts (names double as project-relative
    /// paths). Steps may `require` these without any producer step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,

    /// Seed variables passed through to handlers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,

    /// Ordered list of workflow steps.
    pub steps: Vec<Step>,
}

fn default_schema_version() -> u32 {
    DEFINITION_SCHEMA_VERSION
}

/// Global workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Maximum number of steps executing concurrently.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Default per-attempt timeout in seconds; steps may override.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Default retry policy; steps may override.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Bound on gate loopbacks per gate step.
    #[serde(default = "default_max_loopback")]
    pub max_loopback_iterations: u32,

    /// When snapshots are written.
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,

    /// Optional wall-clock bound for the whole run, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_max_parallel() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_loopback() -> u32 {
    3
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            default_timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
            max_loopback_iterations: default_max_loopback(),
            checkpoint: CheckpointPolicy::default(),
            timeout_secs: None,
        }
    }
}

/// Snapshot cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Snapshot after every ingested step (the default).
    #[default]
    EveryStep,
    /// Snapshot every N ingested steps.
    EveryN { steps: u32 },
    /// Snapshot only after gate steps.
    GateOnly,
    /// Snapshot at most once per interval.
    TimeBased { seconds: u64 },
    /// Snapshot only at workflow exit.
    Manual,
}

/// How a failing gate invalidates upstream work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidateMode {
    /// Invalidate the direct producers of the gate's inputs (and everything
    /// downstream of them).
    #[default]
    Producers,
    /// Invalidate the full upstream closure of those producers as well.
    Transitive,
}

/// A single step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Unique step identifier within the workflow.
    pub id: String,

    /// Agent role executing this step (e.g. `implementer`, `reviewer`).
    pub agent: String,

    /// Action dispatched to the agent's handler.
    pub action: String,

    /// Artifact names this step consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Artifact names this step produces (project-relative paths).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creates: Vec<String>,

    /// Quality thresholds evaluated against the handler's metrics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<BTreeMap<String, f64>>,

    /// Invalidation scope when the gate fails.
    #[serde(default, skip_serializing_if = "is_default_invalidate")]
    pub gate_invalidate: InvalidateMode,

    /// Explicit loopback target; defaults to the gate's input producers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_gate_fail_goto: Option<String>,

    /// Opaque parameters passed to the handler ({{ variables.* }} and
    /// {{ artifacts.* }} placeholders are interpolated first).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,

    /// Per-attempt timeout override, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Retry policy override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// Succeed even when declared artifacts are absent after execution.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_empty_creates: bool,

    /// Record SHA-256 checksums for change detection across loopbacks.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub checksum: bool,
}

fn is_default_invalidate(mode: &InvalidateMode) -> bool {
    *mode == InvalidateMode::Producers
}

impl Step {
    /// Whether this step carries quality thresholds.
    pub fn is_gate(&self) -> bool {
        self.gate.is_some()
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum retry attempts beyond the initial one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Initial delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Exponential backoff (multiplier^n * initial_delay).
    #[default]
    Exponential,

    /// Linear backoff (n * initial_delay).
    Linear,

    /// Constant delay.
    Constant,
}

impl Workflow {
    /// Load a workflow from YAML, migrating older schema versions forward.
    ///
    /// The parse is strict: any unknown top-level or per-step key is an
    /// error. Use [`Workflow::parse`] to also run semantic validation and
    /// cycle detection.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::parse(e.to_string()))?;

        let version = value
            .get("version")
            .and_then(serde_yaml::Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(DEFINITION_SCHEMA_VERSION);

        if version > DEFINITION_SCHEMA_VERSION {
            return Err(EngineError::UnsupportedSchemaVersion(version));
        }

        let migrated = migrate_definition(value, version)?;
        serde_yaml::from_value(migrated).map_err(|e| EngineError::parse(e.to_string()))
    }

    /// Parse and fully validate a workflow definition.
    ///
    /// All parser errors are fatal; no partial workflow is returned.
    pub fn parse(yaml: &str) -> Result<Self> {
        let workflow = Self::from_yaml(yaml)?;
        workflow.validate()?;
        // Cycle detection lives in the dependency graph builder.
        crate::dag::DependencyGraph::from_workflow(&workflow)?;
        Ok(workflow)
    }

    /// Get a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Get all step IDs.
    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// All artifact names produced by any step.
    pub fn created_artifacts(&self) -> HashSet<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.creates.iter().map(String::as_str))
            .collect()
    }

    /// Validate workflow structure (everything except cycles, which the
    /// graph builder detects).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::validation("Workflow id must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(EngineError::validation("Workflow has no steps"));
        }
        if self.config.max_parallel == 0 {
            return Err(EngineError::validation("max_parallel must be at least 1"));
        }

        // Duplicate step IDs.
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::validation(format!(
                    "Duplicate step ID: {}",
                    step.id
                )));
            }
        }

        let created = self.created_artifacts();
        let inputs: HashSet<&str> = self.inputs.iter().map(String::as_str).collect();

        for step in &self.steps {
            // Every requirement must come from some step's creates or from a
            // declared external input.
            for required in &step.requires {
                if !created.contains(required.as_str()) && !inputs.contains(required.as_str()) {
                    return Err(EngineError::DanglingDependency {
                        step_id: step.id.clone(),
                        artifact: required.clone(),
                    });
                }
            }

            if let Some(gate) = &step.gate {
                if gate.is_empty() {
                    return Err(EngineError::validation(format!(
                        "Gate on step '{}' declares no thresholds",
                        step.id
                    )));
                }
                for (metric, threshold) in gate {
                    if !threshold.is_finite() {
                        return Err(EngineError::validation(format!(
                            "Gate threshold '{}' on step '{}' is not a finite number",
                            metric, step.id
                        )));
                    }
                }
            }

            if let Some(goto) = &step.on_gate_fail_goto {
                if !seen.contains(goto.as_str()) {
                    return Err(EngineError::validation(format!(
                        "Step '{}' routes gate failure to unknown step '{}'",
                        step.id, goto
                    )));
                }
                if step.gate.is_none() {
                    return Err(EngineError::validation(format!(
                        "Step '{}' sets on_gate_fail_goto without a gate",
                        step.id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Migrate a definition document one version at a time up to the current
/// schema, then stamp it with the current version.
fn migrate_definition(mut value: serde_yaml::Value, from: u32) -> Result<serde_yaml::Value> {
    use serde_yaml::Value as Yaml;

    let mut version = from;
    while version < DEFINITION_SCHEMA_VERSION {
        match version {
            // v1 -> v2: per-step `quality_gate` renamed to `gate`; config key
            // `max_concurrency` renamed to `max_parallel`.
            1 => {
                if let Some(config) = value.get_mut("config").and_then(Yaml::as_mapping_mut) {
                    if let Some(parallel) = config.remove(&Yaml::from("max_concurrency")) {
                        config.insert(Yaml::from("max_parallel"), parallel);
                    }
                }
                if let Some(steps) = value.get_mut("steps").and_then(Yaml::as_sequence_mut) {
                    for step in steps {
                        if let Some(map) = step.as_mapping_mut() {
                            if let Some(gate) = map.remove(&Yaml::from("quality_gate")) {
                                map.insert(Yaml::from("gate"), gate);
                            }
                        }
                    }
                }
            }
            other => return Err(EngineError::UnsupportedSchemaVersion(other)),
        }
        version += 1;
    }

    if let Some(map) = value.as_mapping_mut() {
        map.insert(
            Yaml::from("version"),
            Yaml::from(DEFINITION_SCHEMA_VERSION),
        );
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
id: "build-service"
description: "analyze, design, implement"
steps:
  - id: "analyze"
    agent: "analyst"
    action: "gather_requirements"
    creates: ["requirements.md"]
  - id: "design"
    agent: "architect"
    action: "draft_architecture"
    requires: ["requirements.md"]
    creates: ["architecture.md"]
"#;

    #[test]
    fn test_parse_linear_workflow() {
        let workflow = Workflow::parse(LINEAR).unwrap();
        assert_eq!(workflow.id, "build-service");
        assert_eq!(workflow.version, DEFINITION_SCHEMA_VERSION);
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.config.max_parallel, 8);
        assert_eq!(workflow.config.max_loopback_iterations, 3);
        assert_eq!(workflow.config.checkpoint, CheckpointPolicy::EveryStep);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let yaml = format!("{LINEAR}\nextra_key: true\n");
        let err = Workflow::parse(&yaml).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn test_unknown_step_key_rejected() {
        let yaml = r#"
id: "wf"
steps:
  - id: "a"
    agent: "analyst"
    action: "run"
    creates: ["out.md"]
    surprise: 1
"#;
        let err = Workflow::parse(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn test_unsupported_schema_version() {
        let yaml = r#"
id: "wf"
version: 99
steps:
  - id: "a"
    agent: "analyst"
    action: "run"
"#;
        let err = Workflow::parse(yaml).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedSchemaVersion(99)));
    }

    #[test]
    fn test_v1_definition_migrates() {
        let yaml = r#"
id: "wf"
version: 1
config:
  max_concurrency: 3
steps:
  - id: "implement"
    agent: "implementer"
    action: "write_code"
    creates: ["src"]
  - id: "review"
    agent: "reviewer"
    action: "score"
    requires: ["src"]
    quality_gate:
      overall: 70
"#;
        let workflow = Workflow::parse(yaml).unwrap();
        assert_eq!(workflow.version, DEFINITION_SCHEMA_VERSION);
        assert_eq!(workflow.config.max_parallel, 3);
        let review = workflow.get_step("review").unwrap();
        assert_eq!(review.gate.as_ref().unwrap()["overall"], 70.0);
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let yaml = r#"
id: "wf"
steps:
  - id: "a"
    agent: "analyst"
    action: "run"
  - id: "a"
    agent: "analyst"
    action: "run"
"#;
        let err = Workflow::parse(yaml).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let yaml = r#"
id: "wf"
steps:
  - id: "b"
    agent: "implementer"
    action: "build"
    requires: ["x"]
"#;
        let err = Workflow::parse(yaml).unwrap_err();
        match err {
            EngineError::DanglingDependency { step_id, artifact } => {
                assert_eq!(step_id, "b");
                assert_eq!(artifact, "x");
            }
            other => panic!("expected DanglingDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_external_input_satisfies_requires() {
        let yaml = r#"
id: "wf"
inputs: ["x"]
steps:
  - id: "b"
    agent: "implementer"
    action: "build"
    requires: ["x"]
"#;
        assert!(Workflow::parse(yaml).is_ok());
    }

    #[test]
    fn test_goto_must_reference_known_step_with_gate() {
        let yaml = r#"
id: "wf"
steps:
  - id: "implement"
    agent: "implementer"
    action: "write_code"
    creates: ["src"]
  - id: "review"
    agent: "reviewer"
    action: "score"
    requires: ["src"]
    gate:
      overall: 70
    on_gate_fail_goto: "nope"
"#;
        assert!(matches!(
            Workflow::parse(yaml).unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    #[test]
    fn test_non_finite_threshold_rejected() {
        let yaml = r#"
id: "wf"
steps:
  - id: "review"
    agent: "reviewer"
    action: "score"
    gate:
      overall: .nan
"#;
        assert!(matches!(
            Workflow::parse(yaml).unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    #[test]
    fn test_checkpoint_policy_forms() {
        let yaml = r#"
id: "wf"
config:
  checkpoint: gate_only
steps:
  - id: "a"
    agent: "analyst"
    action: "run"
"#;
        let workflow = Workflow::parse(yaml).unwrap();
        assert_eq!(workflow.config.checkpoint, CheckpointPolicy::GateOnly);

        let yaml = r#"
id: "wf"
config:
  checkpoint:
    every_n:
      steps: 5
steps:
  - id: "a"
    agent: "analyst"
    action: "run"
"#;
        let workflow = Workflow::parse(yaml).unwrap();
        assert_eq!(
            workflow.config.checkpoint,
            CheckpointPolicy::EveryN { steps: 5 }
        );
    }

    #[test]
    fn test_definition_round_trip() {
        let workflow = Workflow::parse(LINEAR).unwrap();
        let yaml = serde_yaml::to_string(&workflow).unwrap();
        let back = Workflow::from_yaml(&yaml).unwrap();
        assert_eq!(back.id, workflow.id);
        assert_eq!(back.steps.len(), workflow.steps.len());
    }
}
