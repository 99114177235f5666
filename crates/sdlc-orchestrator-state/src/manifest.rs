// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Task manifest rendering.
//!
//! After every state change the engine regenerates `task-manifest.md`, a
//! human-readable view of where the workflow stands: step table, artifact
//! inventory, and outstanding requirements.

use handlebars::Handlebars;
use serde::Serialize;

use crate::models::{ArtifactStatus, WorkflowState};
use crate::store::{StateStoreError, StateStoreResult};

const MANIFEST_TEMPLATE: &str = "\
# Tasks — {{workflow_id}}

Status: **{{status}}**{{#if updated_at}} (updated {{updated_at}}){{/if}}

## Steps

| Step | Agent | Action | Status | Waiting on |
|---|---|---|---|---|
{{#each steps}}| {{id}} | {{agent}} | {{action}} | {{status}} | {{waiting}} |
{{/each}}

## Artifacts

{{#if artifacts}}{{#each artifacts}}- `{{name}}` — {{status}}{{#if created_by}} (by {{created_by}}, v{{version}}){{/if}}
{{/each}}{{else}}_none registered_
{{/if}}
{{#if loopbacks}}
## Loopbacks

{{#each loopbacks}}- {{step_id}}: {{count}}
{{/each}}{{/if}}";

/// Planning info the engine supplies for steps that have not executed yet.
#[derive(Debug, Clone)]
pub struct ManifestStep {
    pub id: String,
    pub agent: String,
    pub action: String,
    pub requires: Vec<String>,
}

#[derive(Serialize)]
struct StepRow {
    id: String,
    agent: String,
    action: String,
    status: String,
    waiting: String,
}

#[derive(Serialize)]
struct ArtifactRow {
    name: String,
    status: String,
    created_by: Option<String>,
    version: u32,
}

#[derive(Serialize)]
struct LoopbackRow {
    step_id: String,
    count: u32,
}

#[derive(Serialize)]
struct ManifestData {
    workflow_id: String,
    status: String,
    updated_at: Option<String>,
    steps: Vec<StepRow>,
    artifacts: Vec<ArtifactRow>,
    loopbacks: Vec<LoopbackRow>,
}

/// Render the manifest markdown for the current state.
pub fn render_manifest(state: &WorkflowState, plan: &[ManifestStep]) -> StateStoreResult<String> {
    let mut renderer = Handlebars::new();
    renderer.register_escape_fn(handlebars::no_escape);

    let steps = plan
        .iter()
        .map(|step| {
            let status = if state.completed_steps.contains(&step.id) {
                "completed".to_string()
            } else if state.failed_steps.contains(&step.id) {
                "failed".to_string()
            } else {
                "pending".to_string()
            };
            let missing: Vec<&str> = step
                .requires
                .iter()
                .filter(|name| !state.artifact_complete(name))
                .map(String::as_str)
                .collect();
            StepRow {
                id: step.id.clone(),
                agent: step.agent.clone(),
                action: step.action.clone(),
                status,
                waiting: if missing.is_empty() {
                    "—".to_string()
                } else {
                    missing.join(", ")
                },
            }
        })
        .collect();

    let artifacts = state
        .artifacts
        .values()
        .map(|artifact| ArtifactRow {
            name: artifact.name.clone(),
            status: match artifact.status {
                ArtifactStatus::Pending => "pending",
                ArtifactStatus::Complete => "complete",
                ArtifactStatus::Failed => "failed",
                ArtifactStatus::Missing => "missing",
            }
            .to_string(),
            created_by: artifact.created_by.clone(),
            version: artifact.version,
        })
        .collect();

    let loopbacks = state
        .loopback_counters
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(step_id, count)| LoopbackRow {
            step_id: step_id.clone(),
            count: *count,
        })
        .collect();

    let data = ManifestData {
        workflow_id: state.workflow_id.clone(),
        status: state.status.to_string(),
        updated_at: state.updated_at.map(|t| t.to_rfc3339()),
        steps,
        artifacts,
        loopbacks,
    };

    renderer
        .render_template(MANIFEST_TEMPLATE, &data)
        .map_err(|e| StateStoreError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Artifact;
    use chrono::Utc;

    fn plan() -> Vec<ManifestStep> {
        vec![
            ManifestStep {
                id: "analyze".to_string(),
                agent: "analyst".to_string(),
                action: "gather_requirements".to_string(),
                requires: vec![],
            },
            ManifestStep {
                id: "design".to_string(),
                agent: "architect".to_string(),
                action: "draft_architecture".to_string(),
                requires: vec!["requirements.md".to_string()],
            },
        ]
    }

    #[test]
    fn test_manifest_lists_steps_and_waits() {
        let mut state = WorkflowState::empty();
        state.workflow_id = "wf-1".to_string();
        state.completed_steps.insert("analyze".to_string());

        let manifest = render_manifest(&state, &plan()).unwrap();
        assert!(manifest.contains("| analyze | analyst | gather_requirements | completed | — |"));
        assert!(manifest.contains("| design | architect | draft_architecture | pending | requirements.md |"));
        assert!(manifest.contains("_none registered_"));
    }

    #[test]
    fn test_manifest_shows_artifacts_and_loopbacks() {
        let mut state = WorkflowState::empty();
        state.workflow_id = "wf-1".to_string();
        state.artifacts.insert(
            "requirements.md".to_string(),
            Artifact {
                name: "requirements.md".to_string(),
                path: "requirements.md".to_string(),
                status: ArtifactStatus::Complete,
                created_by: Some("analyze".to_string()),
                created_at: Utc::now(),
                checksum: None,
                version: 2,
            },
        );
        state.loopback_counters.insert("review".to_string(), 1);

        let manifest = render_manifest(&state, &plan()).unwrap();
        assert!(manifest.contains("`requirements.md` — complete (by analyze, v2)"));
        assert!(manifest.contains("## Loopbacks"));
        assert!(manifest.contains("- review: 1"));
    }
}
