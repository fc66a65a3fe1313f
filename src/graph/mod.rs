//! Dependency graph engine — arena/index adjacency over task ids.
//!
//! The graph is a snapshot: nodes are interned into a flat arena and edges
//! are index pairs, never owned pointers, so parent/child hierarchy and
//! dependency edges share one structure and one cycle check. Mutation happens
//! in `graph::storage` inside the store transaction; this module is pure and
//! synchronous.

pub mod storage;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

pub use storage::GraphStore;

// ─── Edge kind ───────────────────────────────────────────────────────────────

/// Dependency edge flavor. Only `requires` participates in readiness;
/// both participate in the cycle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DepKind {
    Requires,
    Blocks,
}

impl DepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepKind::Requires => "requires",
            DepKind::Blocks => "blocks",
        }
    }
}

impl std::fmt::Display for DepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted dependency edge: `task_id` comes after `depends_on`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Edge {
    pub task_id: String,
    pub depends_on: String,
    pub kind: DepKind,
    pub created_at: i64,
}

// ─── DepGraph ────────────────────────────────────────────────────────────────

/// In-memory adjacency snapshot.
///
/// Two edge families share the arena: dependency edges (`task → depends_on`)
/// and hierarchy edges (`parent → child`). A cycle in their union is rejected,
/// so a child can never `require` its own parent while a parent may still
/// `require` its children.
#[derive(Debug, Default, Clone)]
pub struct DepGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    deps: Vec<Vec<(usize, DepKind)>>,
    hier: Vec<Vec<usize>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a task id, returning its arena index.
    pub fn node(&mut self, id: &str) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.ids.len();
        self.ids.push(id.to_string());
        self.index.insert(id.to_string(), i);
        self.deps.push(Vec::new());
        self.hier.push(Vec::new());
        i
    }

    pub fn add_dep(&mut self, task: &str, depends_on: &str, kind: DepKind) {
        let from = self.node(task);
        let to = self.node(depends_on);
        self.deps[from].push((to, kind));
    }

    pub fn add_parent(&mut self, parent: &str, child: &str) {
        let from = self.node(parent);
        let to = self.node(child);
        self.hier[from].push(to);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True when `to` is reachable from `from` over the union of dependency
    /// and hierarchy edges. A node always reaches itself.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let (Some(&start), Some(&goal)) = (self.index.get(from), self.index.get(to)) else {
            return from == to;
        };
        if start == goal {
            return true;
        }
        let mut stack = vec![start];
        let mut seen = HashSet::from([start]);
        while let Some(u) = stack.pop() {
            for &(v, _) in &self.deps[u] {
                if v == goal {
                    return true;
                }
                if seen.insert(v) {
                    stack.push(v);
                }
            }
            for &v in &self.hier[u] {
                if v == goal {
                    return true;
                }
                if seen.insert(v) {
                    stack.push(v);
                }
            }
        }
        false
    }

    /// Would inserting `task → depends_on` close a cycle?
    /// Check-before-insert: callers reject without mutating the edge set.
    pub fn would_cycle(&self, task: &str, depends_on: &str) -> bool {
        self.reaches(depends_on, task)
    }

    /// Consume the snapshot into a lazy breadth-first walk of `root`'s
    /// transitive dependencies (both kinds, hierarchy excluded). Finite
    /// because the snapshot is acyclic by invariant; non-restartable.
    pub fn into_walk(self, root: &str) -> DependencyTree {
        let mut queue = VecDeque::new();
        let mut seen = HashSet::new();
        if let Some(&start) = self.index.get(root) {
            seen.insert(start);
            for &(v, _) in &self.deps[start] {
                if seen.insert(v) {
                    queue.push_back(v);
                }
            }
        }
        DependencyTree {
            graph: self,
            queue,
            seen,
        }
    }
}

/// Lazy BFS over transitive dependencies. Yields each dependency once, in
/// breadth-first order, excluding the root itself.
pub struct DependencyTree {
    graph: DepGraph,
    queue: VecDeque<usize>,
    seen: HashSet<usize>,
}

impl Iterator for DependencyTree {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let u = self.queue.pop_front()?;
        for &(v, _) in &self.graph.deps[u] {
            if self.seen.insert(v) {
                self.queue.push_back(v);
            }
        }
        Some(self.graph.ids[u].clone())
    }
}
