//! Dependency graph for validating task batches and walking dependents.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::TaskId;

/// Dependency graph for tracking task dependencies.
///
/// Tasks currently carry at most one dependency, but the graph does not
/// assume that.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(task, depends_on)` pairs.
    pub fn from_edges(edges: impl IntoIterator<Item = (TaskId, Option<TaskId>)>) -> Self {
        let mut graph = Self::new();
        for (task, depends_on) in edges {
            if let Some(depends_on) = depends_on {
                graph.add_dependency(task, depends_on);
            }
        }
        graph
    }

    /// Add a dependency: `task` depends on `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Tasks directly waiting for `task`.
    pub fn dependents_of(&self, task: TaskId) -> Vec<TaskId> {
        let mut out: Vec<TaskId> = self
            .reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// All tasks that (transitively) wait for `task`, breadth first.
    /// `task` itself is not included.
    pub fn transitive_dependents(&self, task: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::from([task]);
        let mut queue = VecDeque::from([task]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if seen.insert(dependent) {
                    out.push(dependent);
                    queue.push_back(dependent);
                }
            }
        }
        out
    }

    pub fn dependencies_of(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Detect a cycle. Returns the first cycle found (closing node repeated
    /// at the end), or None if the graph is a DAG.
    ///
    /// Three-color DFS: Gray = on the current path, Black = fully explored.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: HashMap<TaskId, Color> = HashMap::new();
        let mut starts: Vec<TaskId> = self.edges.keys().copied().collect();
        starts.sort();

        for start in starts {
            if colors.contains_key(&start) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: TaskId,
        colors: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for dep in self.dependencies_of(node) {
            match colors.get(&dep) {
                Some(Color::Gray) => {
                    let from = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[from..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Some(Color::Black) => {}
                None => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}
