// Copyright (c) 2025 SDLC Platform
// SPDX-License-Identifier: Apache-2.0

//! Quality-gate evaluation and loopback planning.
//!
//! A gate step declares named thresholds; after the step succeeds its
//! reported metrics are compared against them. On failure the engine
//! invalidates the producers of the gate's inputs (or an explicit goto
//! target) plus everything downstream, bounded by the loopback counter.
//! The parse-time graph stays acyclic: loopback is an engine-time
//! interpretation, not a YAML edge.

use std::collections::{BTreeMap, BTreeSet};

use crate::dag::DependencyGraph;
use crate::workflow::{InvalidateMode, Step};

/// Result of comparing metrics against thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct GateEvaluation {
    pub passed: bool,
    /// Threshold names that were missing or below their bound.
    pub failed: Vec<String>,
}

/// Compare reported metrics against a gate's thresholds.
///
/// A metric the handler did not report counts as a failure; silence must
/// not pass a gate.
pub fn evaluate(thresholds: &BTreeMap<String, f64>, metrics: &BTreeMap<String, f64>) -> GateEvaluation {
    let failed: Vec<String> = thresholds
        .iter()
        .filter(|(name, bound)| match metrics.get(*name) {
            Some(value) => value < bound,
            None => true,
        })
        .map(|(name, _)| name.clone())
        .collect();

    GateEvaluation {
        passed: failed.is_empty(),
        failed,
    }
}

/// Steps and registered artifacts a loopback must invalidate.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationPlan {
    pub steps: Vec<String>,
    pub artifacts: Vec<String>,
}

/// Compute the loopback target set for a failed gate.
///
/// Seed selection, in priority order:
/// 1. the gate's `on_gate_fail_goto` step;
/// 2. producers of the artifacts named in the handler's
///    `targets_for_improvement`;
/// 3. producers of the gate's own `requires`.
///
/// With [`InvalidateMode::Transitive`] the seeds expand to their full
/// upstream closure first. The plan is the downstream closure of the seeds,
/// always including the gate itself so it re-evaluates after rework.
pub fn invalidation_plan(
    graph: &DependencyGraph,
    gate_step: &Step,
    improvement_targets: &[String],
) -> InvalidationPlan {
    let mut seeds: BTreeSet<String> = BTreeSet::new();

    if let Some(goto) = &gate_step.on_gate_fail_goto {
        seeds.insert(goto.clone());
    } else {
        let target_artifacts: Vec<&String> = if improvement_targets.is_empty() {
            gate_step.requires.iter().collect()
        } else {
            improvement_targets.iter().collect()
        };
        for artifact in target_artifacts {
            for producer in graph.producers_of(artifact) {
                seeds.insert(producer.clone());
            }
        }
    }

    if gate_step.gate_invalidate == InvalidateMode::Transitive {
        seeds = graph.upstream_closure(seeds.iter());
    }

    let mut steps = graph.downstream_closure(seeds.iter());
    steps.insert(gate_step.id.clone());

    // Invalidating a step supersedes the artifacts it produced.
    let mut artifacts = BTreeSet::new();
    for (artifact, producers) in graph.artifact_producers() {
        if producers.iter().any(|p| steps.contains(p)) {
            artifacts.insert(artifact.to_string());
        }
    }

    InvalidationPlan {
        steps: steps.into_iter().collect(),
        artifacts: artifacts.into_iter().collect(),
    }
}
