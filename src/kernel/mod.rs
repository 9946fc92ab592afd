//! Geometry kernel interface
//!
//! The kernel performs the actual construction of a part from its resolved
//! inputs. The pipeline treats it as an opaque, blocking, deterministic
//! function and calls it at most once per fingerprint.

pub mod manifest;

pub use manifest::{ManifestKernel, PartManifest};

use crate::cache::ArtifactLease;
use crate::error::KernelError;
use crate::fingerprint::Fingerprint;
use crate::graph::NodeKind;
use crate::params::ParamValue;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// External geometry kernel.
///
/// `build` runs on a worker thread and may block for as long as the
/// construction takes. It must be deterministic for identical inputs and
/// must not mutate shared state.
pub trait GeometryKernel: Send + Sync + 'static {
    /// Opaque artifact produced for one part
    type Shape: Send + Sync + 'static;

    /// Construct a part
    fn build(
        &self,
        kind: &NodeKind,
        inputs: &ResolvedInputs<Self::Shape>,
    ) -> Result<Self::Shape, KernelError>;

    /// Cache weight of an artifact
    fn weight(&self, _shape: &Self::Shape) -> u64 {
        1
    }

    /// Whether a cached artifact is still usable (e.g. not disposed)
    fn is_alive(&self, _shape: &Self::Shape) -> bool {
        true
    }
}

/// Everything a kernel build may read: the node's declared parameter values
/// from one snapshot, and its dependencies' artifacts in declared order.
///
/// Dependency artifacts are leased, so they stay cached until the build
/// finishes.
pub struct ResolvedInputs<S> {
    node: String,
    fingerprint: Fingerprint,
    params: BTreeMap<String, ParamValue>,
    dependencies: Vec<(String, ArtifactLease<S>)>,
}

impl<S> ResolvedInputs<S> {
    pub fn new(
        node: impl Into<String>,
        fingerprint: Fingerprint,
        params: BTreeMap<String, ParamValue>,
        dependencies: Vec<(String, ArtifactLease<S>)>,
    ) -> Self {
        Self {
            node: node.into(),
            fingerprint,
            params,
            dependencies,
        }
    }

    /// Id of the node being built
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Fingerprint the result will be cached under
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Numeric parameter, failing the build if absent or not a number
    pub fn float(&self, name: &str) -> Result<f64, KernelError> {
        self.param(name)
            .and_then(ParamValue::as_f64)
            .ok_or_else(|| KernelError::new(format!("{} needs numeric parameter {}", self.node, name)))
    }

    /// Declared parameters in name order
    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    /// Artifact of a dependency
    pub fn dependency(&self, id: &str) -> Option<&S> {
        self.dependencies
            .iter()
            .find(|(dep, _)| dep == id)
            .map(|(_, lease)| &**lease)
    }

    /// Dependency artifacts in declared order
    pub fn dependencies(&self) -> impl Iterator<Item = (&str, &ArtifactLease<S>)> {
        self.dependencies
            .iter()
            .map(|(id, lease)| (id.as_str(), lease))
    }
}

impl<S> fmt::Debug for ResolvedInputs<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedInputs")
            .field("node", &self.node)
            .field("fingerprint", &self.fingerprint)
            .field("params", &self.params)
            .field(
                "dependencies",
                &self.dependencies.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

type BuilderFn<S> = Arc<dyn Fn(&ResolvedInputs<S>) -> Result<S, KernelError> + Send + Sync>;
type WeightFn<S> = Arc<dyn Fn(&S) -> u64 + Send + Sync>;
type AliveFn<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;

/// Kernel assembled from one builder function per node kind
pub struct BuilderTable<S> {
    builders: HashMap<NodeKind, BuilderFn<S>>,
    weigher: Option<WeightFn<S>>,
    liveness: Option<AliveFn<S>>,
}

impl<S> Default for BuilderTable<S> {
    fn default() -> Self {
        Self {
            builders: HashMap::new(),
            weigher: None,
            liveness: None,
        }
    }
}

impl<S: Send + Sync + 'static> BuilderTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the builder for a kind, replacing any previous one
    pub fn with<F>(mut self, kind: NodeKind, builder: F) -> Self
    where
        F: Fn(&ResolvedInputs<S>) -> Result<S, KernelError> + Send + Sync + 'static,
    {
        self.builders.insert(kind, Arc::new(builder));
        self
    }

    /// Weigh artifacts with `f` instead of counting entries
    pub fn weigh_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&S) -> u64 + Send + Sync + 'static,
    {
        self.weigher = Some(Arc::new(f));
        self
    }

    /// Check cached artifacts with `f` before reuse
    pub fn check_alive_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&S) -> bool + Send + Sync + 'static,
    {
        self.liveness = Some(Arc::new(f));
        self
    }

    /// Whether a builder is registered for a kind
    pub fn supports(&self, kind: &NodeKind) -> bool {
        self.builders.contains_key(kind)
    }
}

impl<S: Send + Sync + 'static> GeometryKernel for BuilderTable<S> {
    type Shape = S;

    fn build(&self, kind: &NodeKind, inputs: &ResolvedInputs<S>) -> Result<S, KernelError> {
        let builder = self
            .builders
            .get(kind)
            .ok_or_else(|| KernelError::new(format!("no builder registered for {} parts", kind)))?;
        builder(inputs)
    }

    fn weight(&self, shape: &S) -> u64 {
        self.weigher.as_ref().map_or(1, |f| f(shape))
    }

    fn is_alive(&self, shape: &S) -> bool {
        self.liveness.as_ref().map_or(true, |f| f(shape))
    }
}
