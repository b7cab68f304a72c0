//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Edges point from a dependency to the task that waits on it. The DAG
//! answers the scheduler's questions: which tasks are ready, and which
//! tasks sit downstream of a failure.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Why one task waits on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// A freeze task waits on the implementation of its own module.
    OwnImplementation,
    /// A consumer waits for a dependency's interface to be frozen.
    #[default]
    Interface,
    /// A consumer waits on a dependency that declares no interface.
    Implementation,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::OwnImplementation => write!(f, "own-implementation"),
            DependencyKind::Interface => write!(f, "interface"),
            DependencyKind::Implementation => write!(f, "implementation"),
        }
    }
}

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<Task, DependencyKind>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Add a task to the DAG.
    ///
    /// If a task with the same id exists, its index is returned and the
    /// DAG is left unchanged.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `to` cannot start before `from` completes.
    ///
    /// # Errors
    /// Returns an error if either task is missing or the edge would
    /// close a cycle. The DAG is unchanged on error.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        kind: DependencyKind,
    ) -> Result<()> {
        let from_index = *self
            .task_index
            .get(from)
            .ok_or_else(|| Error::TaskNotFound(from.clone()))?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::TaskNotFound(to.clone()))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, kind);
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::CyclicDependency {
                from: from.clone(),
                to: to.clone(),
            });
        }

        if let Some(task) = self.graph.node_weight_mut(to_index) {
            task.deps.push(from.clone());
        }
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// Like [`get_task_mut`](Self::get_task_mut) but reports a missing task.
    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<DependencyKind> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Tasks the given task waits on.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable downstream of `id`, sorted by id.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut found = BTreeSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(index) = bfs.next(&self.graph) {
            if index != start {
                if let Some(task) = self.graph.node_weight(index) {
                    found.insert(task.id.clone());
                }
            }
        }
        found.into_iter().collect()
    }

    /// Every task upstream of `id`, sorted by id.
    pub fn transitive_dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut found = BTreeSet::new();
        let mut bfs = Bfs::new(reversed, start);
        while let Some(index) = bfs.next(reversed) {
            if index != start {
                if let Some(task) = self.graph.node_weight(index) {
                    found.insert(task.id.clone());
                }
            }
        }
        found.into_iter().collect()
    }

    /// All tasks, sorted by id.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.all_tasks().into_iter().map(|t| t.id.clone()).collect()
    }

    /// Whether every dependency of `id` reached its required terminal state.
    pub fn dependencies_complete(&self, id: &TaskId) -> bool {
        self.get_dependencies(id).iter().all(|dep| dep.is_complete())
    }

    // ========== Scheduling Operations ==========

    /// Pending tasks whose dependencies are all complete, sorted by id.
    pub fn newly_ready(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_weights()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| self.dependencies_complete(&task.id))
            .map(|task| task.id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Tasks waiting for a worker (Ready or Retrying), sorted by id.
    pub fn dispatchable(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .graph
            .node_weights()
            .filter(|task| task.status.is_dispatchable())
            .map(|task| task.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether no task can make further progress.
    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(Task::is_terminal)
    }

    /// Tasks in an order where every task follows all of its dependencies.
    ///
    /// Ties are not broken by id; use [`all_tasks`](Self::all_tasks) when a
    /// stable listing is needed.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.clone())
                .unwrap_or_else(|| TaskId::implement("unknown"));
            Error::CyclicDependency {
                from: id.clone(),
                to: id,
            }
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Check that every recorded dependency id resolves to a task here.
    pub fn validate(&self) -> Result<()> {
        for task in self.graph.node_weights() {
            for dep in &task.deps {
                if !self.task_index.contains_key(dep) {
                    return Err(Error::TaskNotFound(dep.clone()));
                }
            }
        }
        Ok(())
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
