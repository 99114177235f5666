// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Artifact dependency graph builder and resolver.
//!
//! Steps are nodes; an edge `producer -> consumer` exists for every artifact
//! name that appears in the producer's `creates` and the consumer's
//! `requires`. The graph is validated acyclic at parse time; loopback edges
//! are an engine-time interpretation and never appear here.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use sdlc_orchestrator_state::{BlockReport, BlockedStep, WorkflowState};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{EngineError, Result};
use crate::workflow::Workflow;

/// Dependency graph over a workflow's steps.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node weight is the step id; edge weight the artifact name carried.
    graph: DiGraph<String, String>,

    /// Mapping from step ID to node index.
    step_to_node: HashMap<String, NodeIndex>,

    /// Artifact name -> producer step ids.
    producers: BTreeMap<String, Vec<String>>,

    /// Artifact names supplied externally rather than by a step.
    external_inputs: BTreeSet<String>,
}

impl DependencyGraph {
    /// Build the graph from a workflow, rejecting dangling requirements and
    /// cycles (the cycle members are listed in the error).
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut step_to_node = HashMap::new();
        let mut producers: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for step in &workflow.steps {
            let node_idx = graph.add_node(step.id.clone());
            step_to_node.insert(step.id.clone(), node_idx);
            for created in &step.creates {
                producers
                    .entry(created.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        let external_inputs: BTreeSet<String> = workflow.inputs.iter().cloned().collect();

        for step in &workflow.steps {
            let target_idx = step_to_node[&step.id];
            for required in &step.requires {
                match producers.get(required) {
                    Some(sources) => {
                        for source in sources {
                            graph.add_edge(step_to_node[source], target_idx, required.clone());
                        }
                    }
                    None if external_inputs.contains(required) => {}
                    None => {
                        return Err(EngineError::DanglingDependency {
                            step_id: step.id.clone(),
                            artifact: required.clone(),
                        });
                    }
                }
            }
        }

        let dag = Self {
            graph,
            step_to_node,
            producers,
            external_inputs,
        };
        dag.check_acyclic()?;
        Ok(dag)
    }

    /// Reject cycles, listing the members of one offending cycle.
    fn check_acyclic(&self) -> Result<()> {
        if toposort(&self.graph, None).is_ok() {
            return Ok(());
        }

        // A strongly connected component larger than one node (or a
        // self-loop) names the cycle.
        for component in tarjan_scc(&self.graph) {
            let is_cycle = component.len() > 1
                || component
                    .first()
                    .map(|&idx| self.graph.find_edge(idx, idx).is_some())
                    .unwrap_or(false);
            if is_cycle {
                let mut cycle: Vec<String> = component
                    .iter()
                    .map(|&idx| self.graph[idx].clone())
                    .collect();
                cycle.sort();
                return Err(EngineError::CyclicDependency { cycle });
            }
        }

        Err(EngineError::CyclicDependency { cycle: Vec::new() })
    }

    /// Compute the ready set: steps that have not finished (completed or
    /// failed) and whose every requirement is registered as a complete
    /// artifact. Ordered by step id for deterministic logs and tests.
    pub fn ready_steps(&self, workflow: &Workflow, state: &WorkflowState) -> Vec<String> {
        let mut ready: Vec<String> = workflow
            .steps
            .iter()
            .filter(|step| {
                !state.completed_steps.contains(&step.id)
                    && !state.failed_steps.contains(&step.id)
                    && step.requires.iter().all(|name| state.artifact_complete(name))
            })
            .map(|step| step.id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Report what every unfinished step is still waiting on.
    pub fn diagnose_block(&self, workflow: &Workflow, state: &WorkflowState) -> BlockReport {
        let mut entries: Vec<BlockedStep> = workflow
            .steps
            .iter()
            .filter(|step| {
                !state.completed_steps.contains(&step.id)
                    && !state.failed_steps.contains(&step.id)
            })
            .map(|step| BlockedStep {
                step_id: step.id.clone(),
                missing: step
                    .requires
                    .iter()
                    .filter(|name| !state.artifact_complete(name))
                    .cloned()
                    .collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        BlockReport { entries }
    }

    /// Steps nothing depends on; completing all of them completes the
    /// workflow.
    pub fn terminal_steps(&self) -> Vec<String> {
        let mut terminals: Vec<String> = self
            .graph
            .externals(petgraph::Direction::Outgoing)
            .map(|idx| self.graph[idx].clone())
            .collect();
        terminals.sort();
        terminals
    }

    /// Producer step ids for an artifact name (empty for external inputs).
    pub fn producers_of(&self, artifact: &str) -> &[String] {
        self.producers
            .get(artifact)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the artifact is declared as an external input.
    pub fn is_external_input(&self, artifact: &str) -> bool {
        self.external_inputs.contains(artifact)
    }

    /// Iterate over every (artifact name, producer step ids) pair.
    pub fn artifact_producers(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.producers
            .iter()
            .map(|(name, producers)| (name.as_str(), producers.as_slice()))
    }

    /// Seed steps plus everything reachable downstream of them.
    pub fn downstream_closure<'a, I>(&self, seeds: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.closure(seeds, petgraph::Direction::Outgoing)
    }

    /// Seed steps plus everything reachable upstream of them.
    pub fn upstream_closure<'a, I>(&self, seeds: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.closure(seeds, petgraph::Direction::Incoming)
    }

    fn closure<'a, I>(&self, seeds: I, direction: petgraph::Direction) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut visited = BTreeSet::new();
        let mut stack: Vec<NodeIndex> = seeds
            .into_iter()
            .filter_map(|id| self.step_to_node.get(id).copied())
            .collect();

        while let Some(node) = stack.pop() {
            if !visited.insert(self.graph[node].clone()) {
                continue;
            }
            for neighbor in self.graph.neighbors_directed(node, direction) {
                if !visited.contains(&self.graph[neighbor]) {
                    stack.push(neighbor);
                }
            }
        }
        visited
    }

    /// Whether any transitive upstream step of `step_id` is in the given set.
    pub fn has_upstream_in(&self, step_id: &str, set: &BTreeSet<String>) -> bool {
        let id = step_id.to_string();
        self.upstream_closure(std::iter::once(&id))
            .iter()
            .any(|ancestor| ancestor != step_id && set.contains(ancestor))
    }

    /// Get total number of steps.
    pub fn step_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Check if a step exists in the graph.
    pub fn contains_step(&self, step_id: &str) -> bool {
        self.step_to_node.contains_key(step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sdlc_orchestrator_state::{Artifact, ArtifactStatus};

    fn diamond() -> Workflow {
        Workflow::parse(
            r#"
id: "diamond"
steps:
  - id: "plan"
    agent: "planner"
    action: "plan"
    creates: ["spec"]
  - id: "api"
    agent: "implementer"
    action: "build"
    requires: ["spec"]
    creates: ["a"]
  - id: "ui"
    agent: "implementer"
    action: "build"
    requires: ["spec"]
    creates: ["b"]
  - id: "release"
    agent: "ops"
    action: "ship"
    requires: ["a", "b"]
    creates: ["bundle"]
"#,
        )
        .unwrap()
    }

    fn register(state: &mut WorkflowState, name: &str, created_by: &str) {
        state.completed_steps.insert(created_by.to_string());
        state.artifacts.insert(
            name.to_string(),
            Artifact {
                name: name.to_string(),
                path: name.to_string(),
                status: ArtifactStatus::Complete,
                created_by: Some(created_by.to_string()),
                created_at: Utc::now(),
                checksum: None,
                version: 1,
            },
        );
    }

    #[test]
    fn test_ready_starts_with_roots() {
        let workflow = diamond();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();
        let state = WorkflowState::empty();

        assert_eq!(graph.ready_steps(&workflow, &state), vec!["plan"]);
    }

    #[test]
    fn test_ready_after_fanout_parent() {
        let workflow = diamond();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();
        let mut state = WorkflowState::empty();
        register(&mut state, "spec", "plan");

        assert_eq!(graph.ready_steps(&workflow, &state), vec!["api", "ui"]);
    }

    #[test]
    fn test_join_waits_for_all_inputs() {
        let workflow = diamond();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();
        let mut state = WorkflowState::empty();
        register(&mut state, "spec", "plan");
        register(&mut state, "a", "api");

        assert_eq!(graph.ready_steps(&workflow, &state), vec!["ui"]);

        register(&mut state, "b", "ui");
        assert_eq!(graph.ready_steps(&workflow, &state), vec!["release"]);
    }

    #[test]
    fn test_pending_artifact_is_not_ready() {
        let workflow = diamond();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();
        let mut state = WorkflowState::empty();
        register(&mut state, "spec", "plan");
        state.artifacts.get_mut("spec").unwrap().status = ArtifactStatus::Pending;

        // `plan` already completed, nothing else has its inputs.
        assert!(graph.ready_steps(&workflow, &state).is_empty());
    }

    #[test]
    fn test_cycle_detection_lists_members() {
        let workflow = Workflow::from_yaml(
            r#"
id: "cyclic"
steps:
  - id: "a"
    agent: "implementer"
    action: "build"
    requires: ["y"]
    creates: ["x"]
  - id: "b"
    agent: "implementer"
    action: "build"
    requires: ["x"]
    creates: ["y"]
"#,
        )
        .unwrap();

        match DependencyGraph::from_workflow(&workflow).unwrap_err() {
            EngineError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle_detected() {
        let workflow = Workflow::from_yaml(
            r#"
id: "selfie"
steps:
  - id: "a"
    agent: "implementer"
    action: "build"
    requires: ["x"]
    creates: ["x"]
"#,
        )
        .unwrap();

        assert!(matches!(
            DependencyGraph::from_workflow(&workflow).unwrap_err(),
            EngineError::CyclicDependency { .. }
        ));
    }

    #[test]
    fn test_diagnose_block_lists_missing() {
        let workflow = diamond();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();
        let mut state = WorkflowState::empty();
        register(&mut state, "spec", "plan");

        let report = graph.diagnose_block(&workflow, &state);
        let release = report
            .entries
            .iter()
            .find(|e| e.step_id == "release")
            .unwrap();
        assert_eq!(release.missing, vec!["a", "b"]);
    }

    #[test]
    fn test_terminal_steps() {
        let workflow = diamond();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();
        assert_eq!(graph.terminal_steps(), vec!["release"]);
    }

    #[test]
    fn test_closures() {
        let workflow = diamond();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();

        let seed = vec!["plan".to_string()];
        let down = graph.downstream_closure(&seed);
        assert_eq!(down.len(), 4);

        let seed = vec!["release".to_string()];
        let up = graph.upstream_closure(&seed);
        assert_eq!(up.len(), 4);

        let seed = vec!["api".to_string()];
        let down = graph.downstream_closure(&seed);
        assert!(down.contains("api"));
        assert!(down.contains("release"));
        assert!(!down.contains("ui"));
    }

    #[test]
    fn test_producers_and_external_inputs() {
        let workflow = Workflow::parse(
            r#"
id: "wf"
inputs: ["seed.md"]
steps:
  - id: "a"
    agent: "analyst"
    action: "run"
    requires: ["seed.md"]
    creates: ["out.md"]
"#,
        )
        .unwrap();
        let graph = DependencyGraph::from_workflow(&workflow).unwrap();

        assert!(graph.is_external_input("seed.md"));
        assert!(graph.producers_of("seed.md").is_empty());
        assert_eq!(graph.producers_of("out.md"), ["a"]);
    }
}
