//! Invalidation propagation
//!
//! Parameter edits mark every node that transitively reads the parameter as
//! dirty. Nothing is rebuilt or evicted here: a dirty node only has its
//! fingerprint recomputed on the next request, and if an edit restores an
//! earlier value the old cache entry is still a valid hit.
//!
//! Marks are stamped with the parameter-store version that produced them.
//! A build pass that started from version `v` only clears marks at or below
//! `v`, so an edit that lands mid-pass is never lost.

use crate::error::ForgeResult;
use crate::graph::DependencyGraph;
use crate::params::{ParamValue, ParameterStore};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Node ids whose fingerprint has not been revalidated since an edit
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    marks: HashMap<String, u64>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node dirty as of `version`
    pub fn mark(&mut self, id: &str, version: u64) {
        let mark = self.marks.entry(id.to_string()).or_insert(version);
        *mark = (*mark).max(version);
    }

    /// Mark several nodes dirty as of `version`
    pub fn mark_all<'a, I>(&mut self, ids: I, version: u64)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for id in ids {
            self.mark(id, version);
        }
    }

    pub fn is_dirty(&self, id: &str) -> bool {
        self.marks.contains_key(id)
    }

    /// Version of the newest mark on a node
    pub fn marked_at(&self, id: &str) -> Option<u64> {
        self.marks.get(id).copied()
    }

    /// Clear a node if its newest mark is not newer than `version`.
    ///
    /// Returns whether the node is now clean.
    pub fn clear(&mut self, id: &str, version: u64) -> bool {
        match self.marks.get(id) {
            Some(&mark) if mark > version => false,
            Some(_) => {
                self.marks.remove(id);
                true
            }
            None => true,
        }
    }

    /// Dirty node ids in name order
    pub fn ids(&self) -> BTreeSet<String> {
        self.marks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

/// Outcome of one applied edit batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParamChange {
    /// Store version after the batch
    pub version: u64,
    /// Parameters whose value actually changed
    pub changed: Vec<String>,
    /// Nodes marked dirty by the batch
    pub dirtied: BTreeSet<String>,
}

impl ParamChange {
    /// Whether the batch changed nothing
    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Applies parameter edits and marks affected nodes dirty.
///
/// Lock order is graph, then parameters, then the dirty set; build passes
/// take their snapshot in the same order.
#[derive(Debug, Clone)]
pub struct InvalidationPropagator {
    graph: Arc<RwLock<DependencyGraph>>,
    params: Arc<RwLock<ParameterStore>>,
    dirty: Arc<Mutex<DirtySet>>,
}

impl InvalidationPropagator {
    pub fn new(
        graph: Arc<RwLock<DependencyGraph>>,
        params: Arc<RwLock<ParameterStore>>,
        dirty: Arc<Mutex<DirtySet>>,
    ) -> Self {
        Self {
            graph,
            params,
            dirty,
        }
    }

    /// Apply one edit
    pub fn on_parameter_change(
        &self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> ForgeResult<ParamChange> {
        self.apply_batch(vec![(name.into(), value.into())])
    }

    /// Apply a batch of edits as one version and mark the union of affected
    /// nodes dirty once.
    ///
    /// The parameter write lock is held until the marks are recorded, so a
    /// build pass never snapshots the new values without the marks.
    pub fn apply_batch(&self, edits: Vec<(String, ParamValue)>) -> ForgeResult<ParamChange> {
        let graph = self.graph.read()?;
        let mut params = self.params.write()?;

        let changed = params.apply(edits)?;
        let version = params.version();
        if changed.is_empty() {
            debug!("Parameter batch changed nothing (version {})", version);
            return Ok(ParamChange {
                version,
                ..Default::default()
            });
        }

        let dirtied: BTreeSet<String> = changed
            .iter()
            .flat_map(|name| graph.affected_by(name))
            .collect();

        self.dirty.lock()?.mark_all(&dirtied, version);
        drop(params);

        info!(
            "Applied {} parameter change(s) at version {}, {} node(s) dirty",
            changed.len(),
            version,
            dirtied.len()
        );
        Ok(ParamChange {
            version,
            changed,
            dirtied,
        })
    }

    /// Mark `ids` and everything downstream of them dirty
    pub fn mark_dependents<'a, I>(&self, ids: I) -> ForgeResult<BTreeSet<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let graph = self.graph.read()?;
        let params = self.params.read()?;
        let affected = graph.dependents_closure(ids);
        self.dirty.lock()?.mark_all(&affected, params.version());
        Ok(affected)
    }

    /// Mark every registered node dirty
    pub fn mark_all(&self) -> ForgeResult<usize> {
        let graph = self.graph.read()?;
        let params = self.params.read()?;
        let ids = graph.node_ids();
        self.dirty.lock()?.mark_all(&ids, params.version());
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BuildNode, NodeKind};

    fn propagator() -> (InvalidationPropagator, Arc<Mutex<DirtySet>>) {
        let mut graph = DependencyGraph::new();
        graph
            .register(BuildNode::new("body", NodeKind::Body).params(["body_width", "scale_length"]))
            .unwrap();
        graph
            .register(
                BuildNode::new("neck", NodeKind::Neck)
                    .params(["scale_length"])
                    .after(["body"]),
            )
            .unwrap();
        graph
            .register(
                BuildNode::new("headstock", NodeKind::Headstock)
                    .params(["headstock_angle"])
                    .after(["neck"]),
            )
            .unwrap();
        graph
            .register(BuildNode::new("bridge", NodeKind::Bridge).params(["bridge_height"]))
            .unwrap();

        let dirty = Arc::new(Mutex::new(DirtySet::new()));
        let propagator = InvalidationPropagator::new(
            Arc::new(RwLock::new(graph)),
            Arc::new(RwLock::new(ParameterStore::new())),
            Arc::clone(&dirty),
        );
        (propagator, dirty)
    }

    #[test]
    fn marks_exactly_the_affected_nodes() {
        let (propagator, dirty) = propagator();
        let change = propagator
            .on_parameter_change("headstock_angle", 12.0)
            .unwrap();

        assert_eq!(change.dirtied, BTreeSet::from(["headstock".to_string()]));
        let dirty = dirty.lock().unwrap();
        assert!(dirty.is_dirty("headstock"));
        assert!(!dirty.is_dirty("neck"));
        assert!(!dirty.is_dirty("bridge"));
    }

    #[test]
    fn batch_is_one_version() {
        let (propagator, dirty) = propagator();
        let change = propagator
            .apply_batch(vec![
                ("scale_length".to_string(), ParamValue::Float(25.5)),
                ("headstock_angle".to_string(), ParamValue::Float(9.0)),
            ])
            .unwrap();

        assert_eq!(change.version, 1);
        assert_eq!(change.dirtied.len(), 3);
        assert_eq!(dirty.lock().unwrap().marked_at("headstock"), Some(1));
    }

    #[test]
    fn unchanged_value_marks_nothing() {
        let (propagator, dirty) = propagator();
        propagator.on_parameter_change("bridge_height", 16.0).unwrap();
        dirty.lock().unwrap().clear("bridge", 1);

        let change = propagator.on_parameter_change("bridge_height", 16.0).unwrap();
        assert!(change.is_noop());
        assert!(dirty.lock().unwrap().is_empty());
    }

    #[test]
    fn clear_keeps_newer_marks() {
        let mut dirty = DirtySet::new();
        dirty.mark("neck", 3);
        assert!(!dirty.clear("neck", 2));
        assert!(dirty.is_dirty("neck"));
        assert!(dirty.clear("neck", 3));
        assert!(dirty.is_empty());
    }

    #[test]
    fn structural_marks_cover_dependents() {
        let (propagator, dirty) = propagator();
        let marked = propagator.mark_dependents(["neck"]).unwrap();
        assert_eq!(marked.len(), 2);
        assert_eq!(propagator.mark_all().unwrap(), 4);
        assert_eq!(dirty.lock().unwrap().len(), 4);
    }
}
