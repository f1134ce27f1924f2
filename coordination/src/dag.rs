//! Task DAG — topological validation and ready-set enumeration (spec §4.4).
//!
//! Backed by `petgraph` ("serde-1" feature already in the workspace
//! dependency table) — a good fit since cycle detection and topological
//! batching are exactly what `petgraph::algo` already provides.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::state::{TaskId, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("cycle detected in task DAG")]
    Cycle,

    #[error("unknown task id {0:?} referenced as a dependency")]
    UnknownDependency(TaskId),

    #[error("task {0:?} already present in DAG")]
    DuplicateTask(TaskId),

    #[error("execution stuck: no ready tasks but not all tasks completed")]
    ExecutionStuck,
}

pub type DagResult<T> = Result<T, DagError>;

/// A topologically ordered partition of the DAG: `levels[i]` is a batch of
/// task ids whose dependencies are all satisfied by the union of
/// `levels[0..i]` (spec §4.4 invariant).
pub type Levels = Vec<Vec<TaskId>>;

/// Task dependency graph for one workflow's Execute phase.
pub struct TaskDag {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl TaskDag {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    pub fn add_task(&mut self, id: TaskId) -> DagResult<()> {
        if self.index.contains_key(&id) {
            return Err(DagError::DuplicateTask(id));
        }
        let node = self.graph.add_node(id.clone());
        self.index.insert(id, node);
        Ok(())
    }

    /// Adds an edge `from -> to` meaning `to` depends on `from` (i.e. `from`
    /// must complete before `to` is ready).
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> DagResult<()> {
        let from_idx = *self
            .index
            .get(from)
            .ok_or_else(|| DagError::UnknownDependency(from.clone()))?;
        let to_idx = *self
            .index
            .get(to)
            .ok_or_else(|| DagError::UnknownDependency(to.clone()))?;
        self.graph.add_edge(from_idx, to_idx, ());
        Ok(())
    }

    /// Validate acyclicity and produce `Levels`: a topologically ordered
    /// list of lists, each inner list containing every task whose
    /// dependencies are satisfied at that point (spec §4.4, §4.3 step 7).
    pub fn build(&self) -> DagResult<Levels> {
        let order = toposort(&self.graph, None).map_err(|_| DagError::Cycle)?;

        let mut level_of: HashMap<NodeIndex, usize> = HashMap::new();
        for node in &order {
            let level = self
                .graph
                .neighbors_directed(*node, petgraph::Direction::Incoming)
                .map(|pred| level_of.get(&pred).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(*node, level);
        }

        let max_level = level_of.values().copied().max().unwrap_or(0);
        let mut levels: Levels = vec![Vec::new(); max_level + 1];
        for node in &order {
            let level = level_of[node];
            levels[level].push(self.graph[*node].clone());
        }
        Ok(levels)
    }

    /// Every non-completed task whose dependencies are all in `completed`
    /// (spec §4.4 `GetReadyTasks`). Returns `ExecutionStuck` when some task
    /// remains but none is ready.
    pub fn ready_tasks(
        &self,
        tasks: &HashMap<TaskId, TaskState>,
        completed: &HashSet<TaskId>,
    ) -> DagResult<Vec<TaskId>> {
        let ready: Vec<TaskId> = self
            .index
            .keys()
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                tasks
                    .get(*id)
                    .map(|t| t.dependencies.iter().all(|d| completed.contains(d)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let all_done = self.index.keys().all(|id| completed.contains(id));
        if ready.is_empty() && !all_done {
            return Err(DagError::ExecutionStuck);
        }
        Ok(ready)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.index.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl Default for TaskDag {
    fn default() -> Self {
        Self::new()
    }
}
