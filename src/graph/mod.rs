//! Dependency graph of build nodes
//!
//! Nodes declare the parameters they read and the nodes whose artifacts
//! they consume. The graph is kept acyclic at all times: a registration that
//! would close a cycle is rejected and leaves the graph untouched.
//!
//! Every structural change bumps a generation counter. Build passes record
//! the generation they planned against and are reissued if it moved.

pub mod instrument;

pub use instrument::{instrument_graph, neck_pocket_node, NECK_POCKET};

use crate::error::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Kind of part a node produces; selects the kernel operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    Constructions,
    Fretboard,
    Neck,
    Body,
    Headstock,
    Bridge,
    Nut,
    Assembly,
    Custom(String),
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructions => write!(f, "constructions"),
            Self::Fretboard => write!(f, "fretboard"),
            Self::Neck => write!(f, "neck"),
            Self::Body => write!(f, "body"),
            Self::Headstock => write!(f, "headstock"),
            Self::Bridge => write!(f, "bridge"),
            Self::Nut => write!(f, "nut"),
            Self::Assembly => write!(f, "assembly"),
            Self::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// A named build step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNode {
    pub id: String,
    pub kind: NodeKind,
    /// Parameter names read by this node
    pub param_deps: BTreeSet<String>,
    /// Upstream nodes, in the order their artifacts are handed to the kernel
    pub node_deps: Vec<String>,
}

impl BuildNode {
    /// Create a node with no dependencies
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            param_deps: BTreeSet::new(),
            node_deps: Vec::new(),
        }
    }

    /// Declare parameter dependencies
    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_deps.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare node dependencies (appended in order)
    pub fn after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_deps.extend(ids.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone)]
struct Registered {
    node: BuildNode,
    /// Declaration sequence; breaks ties in topological order
    seq: u64,
}

/// Directed acyclic graph of build nodes keyed by id
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, Registered>,
    next_seq: u64,
    generation: AtomicU64,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Current structural generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register a node, or replace an existing node with the same id.
    ///
    /// Fails with [`ForgeError::Cycle`] if the node would depend on itself
    /// transitively, and with [`ForgeError::UnknownNode`] if a dependency is
    /// not registered. A replaced node keeps its declaration position.
    pub fn register(&mut self, node: BuildNode) -> ForgeResult<u64> {
        let mut seen = HashSet::new();
        for dep in &node.node_deps {
            if !seen.insert(dep.as_str()) {
                return Err(ForgeError::DuplicateDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
            if dep != &node.id && !self.nodes.contains_key(dep) {
                return Err(ForgeError::UnknownNode(dep.clone()));
            }
        }

        if let Some(path) = self.cycle_path(&node) {
            return Err(ForgeError::Cycle {
                node: node.id.clone(),
                path,
            });
        }

        let seq = match self.nodes.get(&node.id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        let id = node.id.clone();
        self.nodes.insert(id.clone(), Registered { node, seq });

        let generation = self.bump_generation();
        info!("Registered node {} (generation {})", id, generation);
        Ok(generation)
    }

    /// Remove a node that nothing else depends on
    pub fn remove(&mut self, id: &str) -> ForgeResult<BuildNode> {
        if !self.nodes.contains_key(id) {
            return Err(ForgeError::UnknownNode(id.to_string()));
        }

        let mut dependents: Vec<String> = self
            .nodes
            .values()
            .filter(|r| r.node.node_deps.iter().any(|d| d == id))
            .map(|r| r.node.id.clone())
            .collect();
        if !dependents.is_empty() {
            dependents.sort();
            return Err(ForgeError::NodeInUse {
                node: id.to_string(),
                dependents,
            });
        }

        let removed = self
            .nodes
            .remove(id)
            .map(|r| r.node)
            .ok_or_else(|| ForgeError::UnknownNode(id.to_string()))?;

        let generation = self.bump_generation();
        info!("Removed node {} (generation {})", id, generation);
        Ok(removed)
    }

    /// Look up a node
    pub fn get(&self, id: &str) -> Option<&BuildNode> {
        self.nodes.get(id).map(|r| &r.node)
    }

    /// Whether a node is registered
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids in declaration order
    pub fn node_ids(&self) -> Vec<String> {
        let mut entries: Vec<&Registered> = self.nodes.values().collect();
        entries.sort_by_key(|r| r.seq);
        entries.into_iter().map(|r| r.node.id.clone()).collect()
    }

    /// Build order for `root` and everything it depends on.
    ///
    /// Dependencies always precede dependents; among nodes that are ready at
    /// the same time, the one declared first comes first.
    pub fn topological_order(&self, root: &str) -> ForgeResult<Vec<String>> {
        if !self.nodes.contains_key(root) {
            return Err(ForgeError::UnknownNode(root.to_string()));
        }

        // Collect the upstream closure of root.
        let mut closure: HashSet<&str> = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !closure.insert(id) {
                continue;
            }
            let entry = self.entry(id)?;
            for dep in &entry.node.node_deps {
                stack.push(dep.as_str());
            }
        }

        // Kahn's algorithm restricted to the closure, ready set ordered by seq.
        let mut remaining: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for &id in &closure {
            let entry = self.entry(id)?;
            remaining.insert(id, entry.node.node_deps.len());
            for dep in &entry.node.node_deps {
                dependents.entry(dep.as_str()).or_default().push(id);
            }
        }

        let mut ready: BinaryHeap<Reverse<(u64, &str)>> = BinaryHeap::new();
        for (&id, &count) in &remaining {
            if count == 0 {
                ready.push(Reverse((self.entry(id)?.seq, id)));
            }
        }

        let mut order = Vec::with_capacity(closure.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id.to_string());
            for &next in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(count) = remaining.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse((self.entry(next)?.seq, next)));
                    }
                }
            }
        }

        if order.len() != closure.len() {
            return Err(ForgeError::Internal(format!(
                "graph below {} is not acyclic",
                root
            )));
        }
        Ok(order)
    }

    /// Every node that reads `param` directly or through a dependency
    pub fn affected_by(&self, param: &str) -> BTreeSet<String> {
        let direct: Vec<&str> = self
            .nodes
            .values()
            .filter(|r| r.node.param_deps.contains(param))
            .map(|r| r.node.id.as_str())
            .collect();
        self.dependents_closure(direct)
    }

    /// `ids` plus every node downstream of them
    pub fn dependents_closure<'a, I>(&self, ids: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for entry in self.nodes.values() {
            for dep in &entry.node.node_deps {
                reverse
                    .entry(dep.as_str())
                    .or_default()
                    .push(entry.node.id.as_str());
            }
        }

        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<&str> = ids
            .into_iter()
            .filter(|id| self.nodes.contains_key(*id))
            .collect();
        while let Some(id) = queue.pop_front() {
            if !affected.insert(id.to_string()) {
                continue;
            }
            if let Some(next) = reverse.get(id) {
                queue.extend(next.iter().copied());
            }
        }
        affected
    }

    fn entry(&self, id: &str) -> ForgeResult<&Registered> {
        self.nodes
            .get(id)
            .ok_or_else(|| ForgeError::UnknownNode(id.to_string()))
    }

    /// Path from `node` back to itself through its proposed dependencies,
    /// if one exists
    fn cycle_path(&self, node: &BuildNode) -> Option<Vec<String>> {
        if node.node_deps.iter().any(|d| d == &node.id) {
            return Some(vec![node.id.clone(), node.id.clone()]);
        }

        for dep in &node.node_deps {
            let mut visited = HashSet::new();
            let mut path = vec![node.id.clone()];
            if self.reaches(dep, &node.id, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn reaches(
        &self,
        from: &str,
        target: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(from.to_string());
        if from == target {
            return true;
        }
        if visited.insert(from.to_string()) {
            if let Some(entry) = self.nodes.get(from) {
                for dep in &entry.node.node_deps {
                    if self.reaches(dep, target, visited, path) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }
}
