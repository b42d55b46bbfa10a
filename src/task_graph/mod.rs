//! Dependency DAG over a bounded task list: cycle detection, readiness
//! queries, and critical-path computation.

mod strategy;

pub use strategy::{CriticalPath, MaxParallel, RateAware, SchedulingStrategy};

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A task as supplied by the caller. Immutable once the graph is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub instructions: String,
    pub workspace_path: String,
    #[serde(default)]
    pub worker_type: Option<String>,
    #[serde(default)]
    pub estimated_rpm: Option<u32>,
}

/// Runtime state of a `TaskNode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Internal node mutated only by the Scheduler.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub deps: HashSet<String>,
    pub dependents: HashSet<String>,
    pub completed: bool,
    pub state: TaskState,
    pub instructions: String,
    pub workspace_path: String,
    pub worker_type: Option<String>,
    pub estimated_rpm: Option<u32>,
}

#[derive(Debug, Error)]
pub enum TaskGraphError {
    #[error("dangling dependency: task '{task}' depends on unknown task '{dependency}'")]
    DanglingDependency { task: String, dependency: String },

    #[error("cycle detected: {0}")]
    Cycle(String),

    #[error("duplicate task id: {0}")]
    DuplicateId(String),
}

/// Dependency DAG over a task list.
///
/// `TaskGraph` owns no lock of its own; the `Scheduler` is responsible for
/// synchronizing mutation (see `spec.md` §4.3 concurrency discipline).
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: HashMap<String, TaskNode>,
    order: Vec<String>,
}

impl TaskGraph {
    /// Build the graph from a task list. Validates uniqueness, dangling
    /// dependencies, and cycles (self-loops count as cycles).
    pub fn new(tasks: Vec<TaskSpec>) -> Result<Self, TaskGraphError> {
        let mut nodes: HashMap<String, TaskNode> = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());

        for task in &tasks {
            if nodes.contains_key(&task.id) {
                return Err(TaskGraphError::DuplicateId(task.id.clone()));
            }
            order.push(task.id.clone());
            nodes.insert(
                task.id.clone(),
                TaskNode {
                    id: task.id.clone(),
                    deps: task.dependencies.iter().cloned().collect(),
                    dependents: HashSet::new(),
                    completed: false,
                    state: TaskState::Pending,
                    instructions: task.instructions.clone(),
                    workspace_path: task.workspace_path.clone(),
                    worker_type: task.worker_type.clone(),
                    estimated_rpm: task.estimated_rpm,
                },
            );
        }

        // Validate dangling deps and build the dependents mirror.
        let mut dependents_to_add: Vec<(String, String)> = Vec::new();
        for node in nodes.values() {
            for dep in &node.deps {
                if !nodes.contains_key(dep) {
                    return Err(TaskGraphError::DanglingDependency {
                        task: node.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents_to_add.push((dep.clone(), node.id.clone()));
            }
        }
        for (dep, dependent) in dependents_to_add {
            nodes.get_mut(&dep).unwrap().dependents.insert(dependent);
        }

        let graph = Self { nodes, order };
        graph.detect_cycle()?;
        Ok(graph)
    }

    fn detect_cycle(&self) -> Result<(), TaskGraphError> {
        let mut marks: HashMap<&str, Mark> = self.order.iter().map(|id| (id.as_str(), Mark::Unvisited)).collect();
        let mut path: Vec<&str> = Vec::new();

        for start in &self.order {
            if marks[start.as_str()] != Mark::Unvisited {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                return Err(TaskGraphError::Cycle(cycle.join(" -> ")));
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(id, Mark::InStack);
        path.push(id);

        let node = &self.nodes[id];
        for dep in &node.dependents {
            // Walk dependents (forward edges: dep -> dependent). A cycle
            // exists if we reach a node already on the current stack.
            let dep = dep.as_str();
            match marks.get(dep).copied() {
                Some(Mark::InStack) => {
                    let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Some(Mark::Done) => continue,
                _ => {
                    if let Some(c) = self.visit(dep, marks, path) {
                        return Some(c);
                    }
                }
            }
        }

        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    /// Ids in `pending` state whose every dependency is `completed`.
    /// Order is deterministic w.r.t. insertion order.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                let node = &self.nodes[*id];
                node.state == TaskState::Pending && node.deps.iter().all(|d| self.nodes[d].completed)
            })
            .cloned()
            .collect()
    }

    /// Longest chain of incomplete tasks, measured in task count. Computed
    /// via topological layering plus per-node longest-incoming-path DP.
    /// Ties broken by first discovery in topological order.
    pub fn critical_path(&self) -> Vec<String> {
        let topo = self.topological_order();

        let mut longest: HashMap<&str, usize> = HashMap::new();
        let mut predecessor: HashMap<&str, Option<&str>> = HashMap::new();

        for id in &topo {
            let node = &self.nodes[id.as_str()];
            if node.completed {
                longest.insert(id, 0);
                predecessor.insert(id, None);
                continue;
            }

            let mut best_len = 1usize;
            let mut best_pred: Option<&str> = None;
            for dep in &node.deps {
                let dep_node = &self.nodes[dep];
                if dep_node.completed {
                    continue;
                }
                let dep_len = *longest.get(dep.as_str()).unwrap_or(&0);
                if dep_len + 1 > best_len {
                    best_len = dep_len + 1;
                    best_pred = Some(dep.as_str());
                }
            }
            longest.insert(id, best_len);
            predecessor.insert(id, best_pred);
        }

        let tail = topo
            .iter()
            .filter(|id| !self.nodes[id.as_str()].completed)
            .max_by_key(|id| (*longest.get(id.as_str()).unwrap_or(&0), std::cmp::Reverse(topo_index(&topo, id))));

        let Some(tail) = tail else {
            return Vec::new();
        };

        let mut path = vec![tail.clone()];
        let mut current = tail.as_str();
        while let Some(Some(pred)) = predecessor.get(current) {
            path.push(pred.to_string());
            current = pred;
        }
        path.reverse();
        path
    }

    fn topological_order(&self) -> Vec<String> {
        let mut indegree: HashMap<&str, usize> = self.order.iter().map(|id| (id.as_str(), 0)).collect();
        for node in self.nodes.values() {
            for dep in &node.deps {
                *indegree.get_mut(dep.as_str()).unwrap() += 0; // dep itself unaffected
            }
        }
        // indegree counts how many deps each node has remaining
        for node in self.nodes.values() {
            indegree.insert(node.id.as_str(), node.deps.len());
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .filter(|id| indegree[id.as_str()] == 0)
            .map(|s| s.as_str())
            .collect();

        let mut result = Vec::with_capacity(self.order.len());
        let mut indegree = indegree;
        while let Some(id) = queue.pop_front() {
            result.push(id.to_string());
            let node = &self.nodes[id];
            let mut newly_ready: Vec<&str> = Vec::new();
            for dependent in &node.dependents {
                let entry = indegree.get_mut(dependent.as_str()).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    newly_ready.push(dependent.as_str());
                }
            }
            // Preserve original insertion order among newly-ready nodes.
            newly_ready.sort_by_key(|id| self.order.iter().position(|o| o == id).unwrap());
            for id in newly_ready {
                queue.push_back(id);
            }
        }
        result
    }

    /// Mark a task completed. Idempotent; unknown ids are silently ignored.
    pub fn mark_completed(&mut self, id: &str) {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.completed = true;
                node.state = TaskState::Completed;
            }
            None => {
                tracing::info!(task_id = id, "mark_completed: unknown task id, ignoring");
            }
        }
    }

    pub fn all_complete(&self) -> bool {
        self.nodes.values().all(|n| n.completed)
    }

    pub fn task_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn completed_count(&self) -> usize {
        self.nodes.values().filter(|n| n.completed).count()
    }

    pub fn get_details(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn get_details_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }
}

fn topo_index(topo: &[String], id: &&String) -> usize {
    topo.iter().position(|t| t == *id).unwrap_or(usize::MAX)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InStack,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            instructions: format!("do {id}"),
            workspace_path: format!("/work/{id}"),
            worker_type: None,
            estimated_rpm: None,
        }
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new(vec![]).unwrap();
        assert!(graph.all_complete());
        assert_eq!(graph.task_count(), 0);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = TaskGraph::new(vec![spec("A", &["A"])]).unwrap_err();
        assert!(matches!(err, TaskGraphError::Cycle(_)));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let err = TaskGraph::new(vec![spec("A", &["B"])]).unwrap_err();
        assert!(matches!(err, TaskGraphError::DanglingDependency { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = TaskGraph::new(vec![spec("A", &["B"]), spec("B", &["A"])]).unwrap_err();
        assert!(matches!(err, TaskGraphError::Cycle(_)));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = TaskGraph::new(vec![spec("A", &[]), spec("A", &[])]).unwrap_err();
        assert!(matches!(err, TaskGraphError::DuplicateId(_)));
    }

    #[test]
    fn test_diamond_ready_tasks() {
        let mut graph = TaskGraph::new(vec![
            spec("A", &[]),
            spec("B", &["A"]),
            spec("C", &["A"]),
            spec("D", &["B", "C"]),
        ])
        .unwrap();

        assert_eq!(graph.ready_tasks(), vec!["A".to_string()]);
        graph.mark_completed("A");
        graph.get_details_mut("A").unwrap().state = TaskState::Completed;

        let mut ready = graph.ready_tasks();
        ready.sort();
        assert_eq!(ready, vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_mark_completed_idempotent() {
        let mut graph = TaskGraph::new(vec![spec("A", &[])]).unwrap();
        graph.mark_completed("A");
        graph.mark_completed("A");
        assert_eq!(graph.completed_count(), 1);
    }

    #[test]
    fn test_mark_completed_unknown_id_ignored() {
        let mut graph = TaskGraph::new(vec![spec("A", &[])]).unwrap();
        graph.mark_completed("nonexistent");
        assert_eq!(graph.completed_count(), 0);
    }

    #[test]
    fn test_critical_path_diamond() {
        let graph = TaskGraph::new(vec![
            spec("A", &[]),
            spec("B", &["A"]),
            spec("C", &["A"]),
            spec("D", &["B", "C"]),
        ])
        .unwrap();

        let path = graph.critical_path();
        assert_eq!(path.last().unwrap(), "D");
        assert_eq!(path.first().unwrap(), "A");
        assert_eq!(path.len(), 3); // A -> B (or C) -> D
    }

    #[test]
    fn test_critical_path_chain_priority() {
        // A, B dep A, C dep B, D dep A -- critical path should be A->B->C
        let graph = TaskGraph::new(vec![spec("A", &[]), spec("B", &["A"]), spec("C", &["B"]), spec("D", &["A"])])
            .unwrap();
        assert_eq!(graph.critical_path(), vec!["A", "B", "C"]);
    }
}
