// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed tasks, edges, and the workflow DAG.

use crate::canonical::{canonical_json, sha256_hex};
use crate::step::Step;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default per-task timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 90_000;

/// Default linear backoff base in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Errors from DAG construction and traversal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// The edge set contains a cycle.
    #[error("cycle detected in task graph")]
    Cycle,
    /// An edge references a task that is not in the DAG.
    #[error("edge endpoint references unknown task: {name}")]
    UnknownEndpoint {
        /// The missing task name.
        name: String,
    },
    /// A task with this name already exists.
    #[error("duplicate task name: {name}")]
    DuplicateTask {
        /// The colliding task name.
        name: String,
    },
}

/// A single schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable name, unique within its DAG.
    pub name: String,
    /// Registered plugin handler that executes this task.
    pub plugin: String,
    /// Opaque inputs handed to the handler.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Wall-clock limit for one attempt, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts after the first. Zero means exactly one attempt.
    #[serde(default)]
    pub max_retries: u32,
    /// Linear backoff base in milliseconds; attempt `n` waits `n × backoff`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

impl Task {
    /// Create a task with default timeout, retry, and backoff settings.
    pub fn new(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            inputs: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 0,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }

    /// One attempt's timeout as a [`std::time::Duration`].
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before retry attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        std::time::Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// A directed dependency between two tasks of the same DAG.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    /// Upstream task name.
    pub from: String,
    /// Downstream task name.
    pub to: String,
}

impl Edge {
    /// Create an edge `from → to`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A typed, acyclic task graph.
///
/// Tasks are keyed by name (the map keeps them sorted, which makes the
/// digest canonical); edges reference task names. `meta` carries free-form
/// annotations and is excluded from the digest so annotating a DAG does not
/// change its identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    /// Tasks keyed by name.
    pub tasks: BTreeMap<String, Task>,
    /// Directed edges between tasks.
    pub edges: Vec<Edge>,
    /// Free-form annotations (not part of the digest).
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl Dag {
    /// Build the linear DAG for an ordered step sequence.
    ///
    /// Tasks are named `"NN_step"` (zero-padded position) with the step's
    /// built-in plugin; edges connect consecutive steps.
    #[must_use]
    pub fn from_steps(steps: &[Step]) -> Self {
        let mut dag = Dag::default();
        let names: Vec<String> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{i:02}_{}", s.name()))
            .collect();
        for (name, step) in names.iter().zip(steps) {
            dag.tasks
                .insert(name.clone(), Task::new(name.clone(), step.plugin()));
        }
        for pair in names.windows(2) {
            dag.edges.push(Edge::new(pair[0].clone(), pair[1].clone()));
        }
        dag
    }

    /// Insert a task, rejecting duplicates.
    ///
    /// # Errors
    ///
    /// [`DagError::DuplicateTask`] if a task with the same name exists.
    pub fn insert_task(&mut self, task: Task) -> Result<(), DagError> {
        if self.tasks.contains_key(&task.name) {
            return Err(DagError::DuplicateTask { name: task.name });
        }
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    /// Add an edge, rejecting endpoints that are not tasks of this DAG.
    ///
    /// # Errors
    ///
    /// [`DagError::UnknownEndpoint`] for a missing `from` or `to` task.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), DagError> {
        for endpoint in [&edge.from, &edge.to] {
            if !self.tasks.contains_key(endpoint) {
                return Err(DagError::UnknownEndpoint {
                    name: endpoint.clone(),
                });
            }
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Stable topological order over task names (Kahn's algorithm).
    ///
    /// Ready tasks are drained in name order, so equal inputs always produce
    /// the same sequence.
    ///
    /// # Errors
    ///
    /// [`DagError::Cycle`] if the edges contain a cycle, or
    /// [`DagError::UnknownEndpoint`] if an edge references a missing task.
    pub fn topo(&self) -> Result<Vec<String>, DagError> {
        let mut indegree: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for e in &self.edges {
            let to = indegree
                .get_mut(e.to.as_str())
                .ok_or_else(|| DagError::UnknownEndpoint { name: e.to.clone() })?;
            *to += 1;
            if !self.tasks.contains_key(&e.from) {
                return Err(DagError::UnknownEndpoint {
                    name: e.from.clone(),
                });
            }
            children.entry(e.from.as_str()).or_default().push(e.to.as_str());
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(name) = ready.pop_front() {
            out.push(name.to_string());
            for child in children.get(name).into_iter().flatten() {
                let d = indegree.get_mut(child).expect("child indexed above");
                *d -= 1;
                if *d == 0 {
                    ready.push_back(child);
                }
            }
        }

        if out.len() != self.tasks.len() {
            return Err(DagError::Cycle);
        }
        Ok(out)
    }

    /// Deterministic identity digest over tasks (sorted by name) and edges
    /// (sorted by `(from, to)`).
    #[must_use]
    pub fn digest(&self) -> String {
        let mut edges = self.edges.clone();
        edges.sort();
        let body = serde_json::json!({
            "tasks": self.tasks,
            "edges": edges,
        });
        let bytes = canonical_json(&body).unwrap_or_default();
        sha256_hex(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::CANONICAL_STEPS;

    #[test]
    fn from_steps_builds_linear_chain() {
        let dag = Dag::from_steps(&CANONICAL_STEPS);
        assert_eq!(dag.tasks.len(), 10);
        assert_eq!(dag.edges.len(), 9);
        assert!(dag.tasks.contains_key("00_verify"));
        assert!(dag.tasks.contains_key("09_continuum"));
        assert_eq!(dag.tasks["03_scan"].plugin, "core.scan");
    }

    #[test]
    fn topo_respects_edges() {
        let dag = Dag::from_steps(&CANONICAL_STEPS);
        let order = dag.topo().unwrap();
        assert_eq!(order.len(), 10);
        for e in &dag.edges {
            let fi = order.iter().position(|n| n == &e.from).unwrap();
            let ti = order.iter().position(|n| n == &e.to).unwrap();
            assert!(fi < ti, "{} must precede {}", e.from, e.to);
        }
    }

    #[test]
    fn topo_detects_cycle() {
        let mut dag = Dag::default();
        dag.insert_task(Task::new("a", "core.verify")).unwrap();
        dag.insert_task(Task::new("b", "core.invoke")).unwrap();
        dag.add_edge(Edge::new("a", "b")).unwrap();
        dag.add_edge(Edge::new("b", "a")).unwrap();
        assert_eq!(dag.topo(), Err(DagError::Cycle));
    }

    #[test]
    fn add_edge_rejects_unknown_endpoint() {
        let mut dag = Dag::default();
        dag.insert_task(Task::new("a", "core.verify")).unwrap();
        let err = dag.add_edge(Edge::new("a", "ghost")).unwrap_err();
        assert_eq!(
            err,
            DagError::UnknownEndpoint {
                name: "ghost".into()
            }
        );
    }

    #[test]
    fn insert_task_rejects_duplicate() {
        let mut dag = Dag::default();
        dag.insert_task(Task::new("a", "core.verify")).unwrap();
        let err = dag.insert_task(Task::new("a", "core.scan")).unwrap_err();
        assert_eq!(err, DagError::DuplicateTask { name: "a".into() });
    }

    #[test]
    fn digest_ignores_meta_and_edge_order() {
        let mut d1 = Dag::from_steps(&CANONICAL_STEPS[..3]);
        let mut d2 = d1.clone();
        d2.edges.reverse();
        d2.meta
            .insert("note".into(), serde_json::json!("annotated"));
        d1.meta.insert("other".into(), serde_json::json!(42));
        assert_eq!(d1.digest(), d2.digest());
    }

    #[test]
    fn digest_changes_with_tasks() {
        let d1 = Dag::from_steps(&CANONICAL_STEPS[..3]);
        let d2 = Dag::from_steps(&CANONICAL_STEPS[..4]);
        assert_ne!(d1.digest(), d2.digest());
    }
}
