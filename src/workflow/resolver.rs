//! Dependency-graph resolution: validates a step set and orders it into
//! execution waves.
//!
//! A wave is the maximal set of steps whose dependencies are already
//! satisfied. Waves are computed once at submission with Kahn's algorithm and
//! are immutable for the lifetime of that submission; re-planning requires a
//! fresh submission.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::core::errors::{Result, WavefrontError};
use crate::workflow::types::{Action, StepId, WorkflowStep};

/// One wave of step ids, ordered by `(priority, submission order)`
pub type Wave = Vec<StepId>;

/// Validates step sets and computes deterministic wave orderings.
pub struct DependencyGraphResolver;

impl DependencyGraphResolver {
    /// Resolve a step set into ordered waves.
    ///
    /// Fails with `Validation` on duplicate ids or self-dependency (checked
    /// before cycle detection), `UnknownDependency` on dangling references,
    /// and `CycleDetected` naming the offending subset.
    pub fn resolve(steps: &[WorkflowStep]) -> Result<Vec<Wave>> {
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index_of.insert(step.step_id.as_str(), i).is_some() {
                return Err(WavefrontError::validation_field(
                    format!("duplicate step id '{}'", step.step_id),
                    "step_id",
                ));
            }
        }

        // Self-dependency is rejected before cycle detection runs
        for step in steps {
            if step.depends_on.iter().any(|d| d == &step.step_id) {
                return Err(WavefrontError::validation_field(
                    format!("step '{}' cannot depend on itself", step.step_id),
                    "depends_on",
                ));
            }
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(steps.len(), steps.len());
        let mut nodes: Vec<NodeIndex> = Vec::with_capacity(steps.len());
        for i in 0..steps.len() {
            nodes.push(graph.add_node(i));
        }
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let &dep_idx = index_of.get(dep.as_str()).ok_or_else(|| {
                    WavefrontError::unknown_dependency(step.step_id.clone(), dep.clone())
                })?;
                graph.add_edge(nodes[dep_idx], nodes[i], ());
            }
        }

        let mut in_degree: Vec<usize> = nodes
            .iter()
            .map(|&n| graph.neighbors_directed(n, petgraph::Direction::Incoming).count())
            .collect();
        let mut emitted: Vec<bool> = vec![false; steps.len()];
        let mut emitted_count = 0usize;
        let mut waves: Vec<Wave> = Vec::new();

        while emitted_count < steps.len() {
            let mut ready: Vec<usize> = (0..steps.len())
                .filter(|&i| !emitted[i] && in_degree[i] == 0)
                .collect();
            if ready.is_empty() {
                let remaining: Vec<usize> =
                    (0..steps.len()).filter(|&i| !emitted[i]).collect();
                let cycle = Self::cycle_members(&graph, &nodes, &remaining);
                return Err(WavefrontError::CycleDetected {
                    steps: cycle.into_iter().map(|i| steps[i].step_id.clone()).collect(),
                });
            }

            // Deterministic order within a wave: ascending priority, then
            // submission order. Required so SEQUENTIAL and PARALLEL runs visit
            // steps reproducibly.
            ready.sort_by_key(|&i| (steps[i].priority, i));

            for &i in &ready {
                emitted[i] = true;
                emitted_count += 1;
                for neighbor in
                    graph.neighbors_directed(nodes[i], petgraph::Direction::Outgoing)
                {
                    let j = graph[neighbor];
                    in_degree[j] = in_degree[j].saturating_sub(1);
                }
            }
            waves.push(ready.iter().map(|&i| steps[i].step_id.clone()).collect());
        }

        debug!(waves = waves.len(), steps = steps.len(), "resolved step graph");
        Ok(waves)
    }

    /// Validate the action set of a submission: ids unique, dependencies
    /// resolve within the submission, the whole set acyclic, and intra-step
    /// dependencies consistent with declaration order.
    pub fn validate_actions(steps: &[WorkflowStep]) -> Result<()> {
        let mut known: HashSet<&str> = HashSet::new();
        for step in steps {
            for action in &step.actions {
                if !known.insert(action.action_id.as_str()) {
                    return Err(WavefrontError::validation_field(
                        format!("duplicate action id '{}'", action.action_id),
                        "action_id",
                    ));
                }
            }
        }

        for step in steps {
            let mut seen_in_step: HashSet<&str> = HashSet::new();
            for action in &step.actions {
                for dep in &action.dependencies {
                    if dep == &action.action_id {
                        return Err(WavefrontError::validation_field(
                            format!("action '{}' cannot depend on itself", action.action_id),
                            "dependencies",
                        ));
                    }
                    if !known.contains(dep.as_str()) {
                        return Err(WavefrontError::unknown_dependency(
                            action.action_id.clone(),
                            dep.clone(),
                        ));
                    }
                    let dep_in_step = step.actions.iter().any(|a| &a.action_id == dep);
                    if dep_in_step && !seen_in_step.contains(dep.as_str()) {
                        return Err(WavefrontError::validation_field(
                            format!(
                                "action '{}' depends on later action '{}' in step '{}'",
                                action.action_id, dep, step.step_id
                            ),
                            "dependencies",
                        ));
                    }
                }
                seen_in_step.insert(action.action_id.as_str());
            }
        }

        let all: Vec<&Action> = steps.iter().flat_map(|s| s.actions.iter()).collect();
        Self::check_actions_acyclic(&all)
    }

    /// Kahn's pass over a flat action set; reports cycle members on failure.
    pub fn check_actions_acyclic(actions: &[&Action]) -> Result<()> {
        let index_of: HashMap<&str, usize> = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.action_id.as_str(), i))
            .collect();
        let mut in_degree = vec![0usize; actions.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];
        for (i, action) in actions.iter().enumerate() {
            for dep in &action.dependencies {
                if let Some(&d) = index_of.get(dep.as_str()) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }
        let mut queue: Vec<usize> = (0..actions.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut emitted = 0usize;
        while let Some(i) = queue.pop() {
            emitted += 1;
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push(j);
                }
            }
        }
        if emitted < actions.len() {
            let members: Vec<String> = (0..actions.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| actions[i].action_id.clone())
                .collect();
            return Err(WavefrontError::CycleDetected { steps: members });
        }
        Ok(())
    }

    /// Narrow a non-emittable remainder down to the steps actually on cycles.
    /// Strips nodes with no outgoing edge into the remainder until fixpoint;
    /// what survives is the cyclic core plus any bridge between cycles.
    fn cycle_members(
        graph: &DiGraph<usize, ()>,
        nodes: &[NodeIndex],
        remaining: &[usize],
    ) -> Vec<usize> {
        let mut members: HashSet<usize> = remaining.iter().copied().collect();
        loop {
            let strip: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| {
                    !graph
                        .neighbors_directed(nodes[i], petgraph::Direction::Outgoing)
                        .any(|n| members.contains(&graph[n]))
                })
                .collect();
            if strip.is_empty() {
                break;
            }
            for i in strip {
                members.remove(&i);
            }
        }
        let mut out: Vec<usize> = members.into_iter().collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{ActionType, WorkflowStep};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn step(id: &str, deps: Vec<&str>) -> WorkflowStep {
        WorkflowStep::new(id, id).depends_on(deps.into_iter().map(String::from).collect())
    }

    #[test]
    fn test_empty_set_trivially_succeeds() {
        let waves = DependencyGraphResolver::resolve(&[]).unwrap();
        assert!(waves.is_empty());
    }

    #[test]
    fn test_linear_chain_one_step_per_wave() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
        ];
        let waves = DependencyGraphResolver::resolve(&steps).unwrap();
        assert_eq!(waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_produces_three_waves() {
        let steps = vec![
            step("root", vec![]),
            step("left", vec!["root"]),
            step("right", vec!["root"]),
            step("join", vec!["left", "right"]),
        ];
        let waves = DependencyGraphResolver::resolve(&steps).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["root"]);
        assert_eq!(waves[1], vec!["left", "right"]);
        assert_eq!(waves[2], vec!["join"]);
    }

    #[test]
    fn test_wave_order_by_priority_then_submission() {
        let steps = vec![
            step("third", vec![]).with_priority(5),
            step("first", vec![]).with_priority(1),
            step("second", vec![]).with_priority(1),
        ];
        let waves = DependencyGraphResolver::resolve(&steps).unwrap();
        // priority 1 before 5; equal priorities keep submission order
        assert_eq!(waves[0], vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unknown_dependency_reported() {
        let steps = vec![step("a", vec!["ghost"])];
        let err = DependencyGraphResolver::resolve(&steps).unwrap_err();
        match err {
            WavefrontError::UnknownDependency { step, dependency } => {
                assert_eq!(step, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("expected UnknownDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_rejected_before_cycle_check() {
        let steps = vec![step("a", vec!["a"])];
        let err = DependencyGraphResolver::resolve(&steps).unwrap_err();
        assert!(matches!(err, WavefrontError::Validation { .. }));
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let steps = vec![step("a", vec![]), step("a", vec![])];
        let err = DependencyGraphResolver::resolve(&steps).unwrap_err();
        assert!(matches!(err, WavefrontError::Validation { .. }));
    }

    #[test]
    fn test_cycle_reports_members_only() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a", "d"]),
            step("c", vec!["b"]),
            step("d", vec!["c"]),
            // downstream of the cycle but not part of it
            step("tail", vec!["d"]),
        ];
        let err = DependencyGraphResolver::resolve(&steps).unwrap_err();
        match err {
            WavefrontError::CycleDetected { mut steps } => {
                steps.sort();
                assert_eq!(steps, vec!["b", "c", "d"]);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_action_validation_catches_cycles() {
        let a1 = Action::new(ActionType::Compute, "t", json!({}))
            .with_id("a1")
            .with_dependencies(vec!["a2".into()]);
        let a2 = Action::new(ActionType::Compute, "t", json!({}))
            .with_id("a2")
            .with_dependencies(vec!["a1".into()]);
        let refs: Vec<&Action> = vec![&a1, &a2];
        let err = DependencyGraphResolver::check_actions_acyclic(&refs).unwrap_err();
        assert!(matches!(err, WavefrontError::CycleDetected { .. }));
    }

    #[test]
    fn test_action_forward_reference_within_step_rejected() {
        let early = Action::new(ActionType::Compute, "t", json!({}))
            .with_id("early")
            .with_dependencies(vec!["late".into()]);
        let late = Action::new(ActionType::Compute, "t", json!({})).with_id("late");
        let steps =
            vec![WorkflowStep::new("s", "s").with_action(early).with_action(late)];
        let err = DependencyGraphResolver::validate_actions(&steps).unwrap_err();
        assert!(matches!(err, WavefrontError::Validation { .. }));
    }
}
