// graph.rs — DependencyGraph: adjacency maps over a project's cards.
//
// Adjacency is kept in both directions: `depends_on` drives readiness
// and cycle detection, `depended_by` answers "who re-blocks if this
// card regresses". Build fails fast on self-dependencies, unknown ids,
// and cycles, so no transition logic ever runs against a malformed
// dependency list.

use std::collections::{BTreeMap, BTreeSet};

use fm_store::{TaskCard, TaskState};

use crate::error::GraphError;

/// One pending↔blocked correction the engine should apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatingChange {
    pub task_id: String,
    pub from: TaskState,
    pub to: TaskState,
}

/// Directed dependency graph over one project's task cards.
///
/// BTree-backed so iteration (and therefore cycle reports and gating
/// change lists) is deterministic.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Card id -> ids it depends on.
    depends_on: BTreeMap<String, BTreeSet<String>>,
    /// Card id -> ids that depend on it.
    depended_by: BTreeMap<String, BTreeSet<String>>,
    /// Card id -> its current lifecycle state.
    states: BTreeMap<String, TaskState>,
    /// Card ids in board sequence order.
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph, rejecting self-references, unknown ids, and
    /// cycles before any caller acts on it.
    pub fn build(cards: &[TaskCard]) -> Result<Self, GraphError> {
        let mut graph = Self {
            depends_on: BTreeMap::new(),
            depended_by: BTreeMap::new(),
            states: BTreeMap::new(),
            order: Vec::new(),
        };

        for card in cards {
            graph.order.push(card.task_id.clone());
            graph.states.insert(card.task_id.clone(), card.state);
            graph.depends_on.entry(card.task_id.clone()).or_default();
            graph.depended_by.entry(card.task_id.clone()).or_default();
        }

        for card in cards {
            for dep in &card.depends_on {
                if dep == &card.task_id {
                    return Err(GraphError::SelfDependency {
                        task: card.task_id.clone(),
                    });
                }
                if !graph.states.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: card.task_id.clone(),
                        dependency: dep.clone(),
                    });
                }
                graph
                    .depends_on
                    .entry(card.task_id.clone())
                    .or_default()
                    .insert(dep.clone());
                graph
                    .depended_by
                    .entry(dep.clone())
                    .or_default()
                    .insert(card.task_id.clone());
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(GraphError::CycleDetected { cycle });
        }
        Ok(graph)
    }

    /// Cards eligible to execute: state pending, every dependency
    /// completed.
    pub fn ready_set(&self) -> BTreeSet<String> {
        self.order
            .iter()
            .filter(|id| self.states.get(*id) == Some(&TaskState::Pending))
            .filter(|id| self.deps_completed(id))
            .cloned()
            .collect()
    }

    /// Whether a card is blocked, and why. `None` means not blocked
    /// (or the id is unknown to this graph).
    pub fn blocked_reason(&self, task_id: &str) -> Option<String> {
        self.states.get(task_id)?;
        let unmet: Vec<&str> = self
            .depends_on
            .get(task_id)
            .into_iter()
            .flatten()
            .filter(|dep| self.states.get(*dep) != Some(&TaskState::Completed))
            .map(|dep| dep.as_str())
            .collect();
        if unmet.is_empty() {
            None
        } else {
            Some(format!(
                "waiting on incomplete dependencies: {}",
                unmet.join(", ")
            ))
        }
    }

    /// Cards that directly depend on `task_id`.
    pub fn dependents(&self, task_id: &str) -> BTreeSet<String> {
        self.depended_by.get(task_id).cloned().unwrap_or_default()
    }

    /// The pending↔blocked recomputation.
    ///
    /// A pending card with an unmet dependency must move to blocked; a
    /// blocked card whose dependencies are all completed again moves
    /// back to pending. Returned in board sequence order for the engine
    /// to apply inside the same atomic write as the mutation that
    /// triggered it.
    pub fn resolve_gating(&self) -> Vec<GatingChange> {
        let mut changes = Vec::new();
        for id in &self.order {
            let state = match self.states.get(id) {
                Some(state) => *state,
                None => continue,
            };
            let satisfied = self.deps_completed(id);
            match state {
                TaskState::Pending if !satisfied => changes.push(GatingChange {
                    task_id: id.clone(),
                    from: TaskState::Pending,
                    to: TaskState::Blocked,
                }),
                TaskState::Blocked if satisfied => changes.push(GatingChange {
                    task_id: id.clone(),
                    from: TaskState::Blocked,
                    to: TaskState::Pending,
                }),
                _ => {}
            }
        }
        changes
    }

    fn deps_completed(&self, task_id: &str) -> bool {
        self.depends_on
            .get(task_id)
            .into_iter()
            .flatten()
            .all(|dep| self.states.get(dep) == Some(&TaskState::Completed))
    }

    /// DFS over `depends_on`, extracting the first cycle found from the
    /// recursion path. Deterministic because nodes and neighbors are
    /// visited in sorted/board order.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut on_path = BTreeSet::new();
        let mut path = Vec::new();

        for node in &self.order {
            if !visited.contains(node) {
                if let Some(cycle) =
                    self.dfs_cycle(node, &mut visited, &mut on_path, &mut path)
                {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut BTreeSet<String>,
        on_path: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        on_path.insert(node.to_string());
        path.push(node.to_string());

        for neighbor in self.depends_on.get(node).into_iter().flatten() {
            if !visited.contains(neighbor) {
                if let Some(cycle) = self.dfs_cycle(neighbor, visited, on_path, path) {
                    return Some(cycle);
                }
            } else if on_path.contains(neighbor) {
                // Every node from the first occurrence of `neighbor` to
                // the top of the path is on the cycle.
                let start = path.iter().position(|n| n == neighbor).unwrap_or(0);
                return Some(path[start..].to_vec());
            }
        }

        path.pop();
        on_path.remove(node);
        None
    }
}
