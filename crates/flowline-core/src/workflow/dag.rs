//! DAG validation and runnable-set computation.
//!
//! Uses `petgraph` to model node dependencies as a directed graph. Dangling
//! dependency references are reported before cycle detection; topological
//! sort then detects cycles and names a node on the cycle. `runnable`
//! answers "which nodes can start now given a completed set" for the
//! scheduler's dispatch loop. Both operations are O(V+E) and mutate nothing.

use std::collections::{HashMap, HashSet};

use flowline_types::workflow::Workflow;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

/// Errors from workflow validation. Not retried; surfaced to the caller of
/// `execute`/`resume`.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A node ID appears more than once in the workflow.
    #[error("duplicate node id '{node_id}'")]
    DuplicateNode { node_id: String },

    /// A node references a dependency that does not exist in the workflow.
    #[error("node '{node_id}' depends on unknown node '{dependency}'")]
    DanglingDependency { node_id: String, dependency: String },

    /// The dependency graph contains a cycle.
    #[error("cycle detected involving node '{node_id}'")]
    CyclicGraph { node_id: String },
}

/// Validate a workflow's node graph.
///
/// Checks, in order: node ID uniqueness, dependency reference integrity,
/// acyclicity. The first violation found is returned.
pub fn validate(workflow: &Workflow) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNode {
                node_id: node.id.clone(),
            });
        }
    }

    // Dangling references are reported before cycle detection.
    for node in &workflow.nodes {
        for dep in &node.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(ValidationError::DanglingDependency {
                    node_id: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Build directed graph: edge from dependency -> dependent
    let id_to_idx: HashMap<&str, usize> = workflow
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = workflow
        .nodes
        .iter()
        .map(|n| graph.add_node(n.id.as_str()))
        .collect();

    for node in &workflow.nodes {
        let to_idx = id_to_idx[node.id.as_str()];
        for dep in &node.dependencies {
            let from_idx = id_to_idx[dep.as_str()];
            graph.add_edge(node_indices[from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| ValidationError::CyclicGraph {
        node_id: graph[cycle.node_id()].to_string(),
    })?;

    Ok(())
}

/// Return every node not yet completed whose dependencies are all completed.
///
/// The order of the returned IDs is unspecified; callers must not rely on
/// it. Callers subtract their own running/failed sets.
pub fn runnable(workflow: &Workflow, completed: &HashSet<String>) -> Vec<String> {
    workflow
        .nodes
        .iter()
        .filter(|node| !completed.contains(&node.id))
        .filter(|node| node.dependencies.iter().all(|dep| completed.contains(dep)))
        .map(|node| node.id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::workflow::{NodeConfig, NodeDefinition, ToolNodeConfig};
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    /// Helper: build a tool node with the given ID and dependencies.
    fn node(id: &str, dependencies: Vec<&str>) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            config: NodeConfig::Tool(ToolNodeConfig {
                executor: "shell".to_string(),
                command: "true".to_string(),
                working_dir: None,
                env: StdHashMap::new(),
                timeout_secs: None,
                image: None,
            }),
            dependencies: dependencies.into_iter().map(String::from).collect(),
            retries: None,
        }
    }

    fn workflow(nodes: Vec<NodeDefinition>) -> Workflow {
        Workflow {
            id: Uuid::now_v7(),
            name: "test".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            inputs: StdHashMap::new(),
            vars: StdHashMap::new(),
            nodes,
            edges: vec![],
        }
    }

    fn completed(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // validate
    // -----------------------------------------------------------------------

    #[test]
    fn test_validate_linear_chain_ok() {
        let wf = workflow(vec![node("a", vec![]), node("b", vec!["a"]), node("c", vec!["b"])]);
        assert!(validate(&wf).is_ok());
    }

    #[test]
    fn test_validate_dangling_dependency() {
        let wf = workflow(vec![node("a", vec!["missing"])]);
        let err = validate(&wf).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::DanglingDependency { ref node_id, ref dependency }
                if node_id == "a" && dependency == "missing"
        ));
    }

    #[test]
    fn test_validate_cycle_names_a_cycle_node() {
        // x -> y -> z -> x
        let wf = workflow(vec![
            node("x", vec!["y"]),
            node("y", vec!["z"]),
            node("z", vec!["x"]),
        ]);
        let err = validate(&wf).unwrap_err();
        match err {
            ValidationError::CyclicGraph { node_id } => {
                assert!(["x", "y", "z"].contains(&node_id.as_str()), "got {node_id}");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_dangling_reported_before_cycle() {
        // Both problems present; the dangling reference wins.
        let wf = workflow(vec![
            node("a", vec!["b", "ghost"]),
            node("b", vec!["a"]),
        ]);
        let err = validate(&wf).unwrap_err();
        assert!(matches!(err, ValidationError::DanglingDependency { .. }));
    }

    #[test]
    fn test_validate_duplicate_node_id() {
        let wf = workflow(vec![node("a", vec![]), node("a", vec![])]);
        let err = validate(&wf).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateNode { ref node_id } if node_id == "a"));
    }

    #[test]
    fn test_validate_is_idempotent() {
        let wf = workflow(vec![node("a", vec![]), node("b", vec!["a"])]);
        assert!(validate(&wf).is_ok());
        assert!(validate(&wf).is_ok());
    }

    #[test]
    fn test_validate_self_dependency_is_a_cycle() {
        let wf = workflow(vec![node("a", vec!["a"])]);
        let err = validate(&wf).unwrap_err();
        assert!(matches!(err, ValidationError::CyclicGraph { ref node_id } if node_id == "a"));
    }

    // -----------------------------------------------------------------------
    // runnable
    // -----------------------------------------------------------------------

    #[test]
    fn test_runnable_roots_first() {
        let wf = workflow(vec![node("a", vec![]), node("b", vec!["a"]), node("c", vec!["a"])]);
        let mut ready = runnable(&wf, &completed(&[]));
        ready.sort();
        assert_eq!(ready, vec!["a"]);
    }

    #[test]
    fn test_runnable_after_dependency_completes() {
        let wf = workflow(vec![node("a", vec![]), node("b", vec!["a"]), node("c", vec!["a"])]);
        let mut ready = runnable(&wf, &completed(&["a"]));
        ready.sort();
        assert_eq!(ready, vec!["b", "c"]);
    }

    #[test]
    fn test_runnable_join_waits_for_all_dependencies() {
        // d depends on both b and c
        let wf = workflow(vec![
            node("a", vec![]),
            node("b", vec!["a"]),
            node("c", vec!["a"]),
            node("d", vec!["b", "c"]),
        ]);
        let ready = runnable(&wf, &completed(&["a", "b"]));
        assert!(!ready.contains(&"d".to_string()));

        let ready = runnable(&wf, &completed(&["a", "b", "c"]));
        assert_eq!(ready, vec!["d"]);
    }

    #[test]
    fn test_runnable_disjoint_from_completed() {
        let wf = workflow(vec![node("a", vec![]), node("b", vec!["a"])]);
        let done = completed(&["a"]);
        let ready = runnable(&wf, &done);
        for id in &ready {
            assert!(!done.contains(id));
        }
    }

    #[test]
    fn test_runnable_all_completed_is_empty() {
        let wf = workflow(vec![node("a", vec![]), node("b", vec!["a"])]);
        assert!(runnable(&wf, &completed(&["a", "b"])).is_empty());
    }
}
