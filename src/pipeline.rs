//! Core-facing pipeline API
//!
//! [`Pipeline`] owns the parameter store, dependency graph, dirty set,
//! artifact cache and scheduler, and exposes the operations an editor
//! front end needs: edit parameters, request artifacts, watch progress.

use crate::cache::{ArtifactCache, ArtifactLease, CachePolicy, CacheStats, EntryInfo};
use crate::config::Config;
use crate::error::ForgeResult;
use crate::graph::{instrument_graph, BuildNode, DependencyGraph};
use crate::invalidate::{DirtySet, InvalidationPropagator, ParamChange};
use crate::kernel::GeometryKernel;
use crate::params::{ParamValue, Parameter, ParameterStore};
use crate::scheduler::{
    BuildReport, BuildScheduler, NodeState, ProgressEvent, ProgressHub, SchedulerParts,
    SubscriptionId, DEFAULT_MAX_REISSUES,
};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::info;

/// Worker and cache settings for a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Kernel worker threads (0 = one per available core)
    pub workers: usize,
    /// Reissues allowed when inputs change during a build pass
    pub max_reissues: usize,
    pub cache: CachePolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            max_reissues: DEFAULT_MAX_REISSUES,
            cache: CachePolicy::default(),
        }
    }
}

impl PipelineOptions {
    /// Options from the `[scheduler]` and `[cache]` config sections
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.scheduler.workers,
            max_reissues: config.scheduler.max_reissues,
            cache: CachePolicy {
                budget: config.cache.budget_bytes(),
                max_idle: match config.cache.max_idle_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            },
        }
    }
}

/// Incremental, parallel part builds over a parameter store
pub struct Pipeline<K: GeometryKernel> {
    graph: Arc<RwLock<DependencyGraph>>,
    params: Arc<RwLock<ParameterStore>>,
    dirty: Arc<Mutex<DirtySet>>,
    propagator: InvalidationPropagator,
    cache: ArtifactCache<K::Shape>,
    progress: Arc<ProgressHub>,
    scheduler: BuildScheduler<K>,
}

impl<K: GeometryKernel> Pipeline<K> {
    /// Assemble a pipeline over an existing graph and parameter store
    pub fn new(
        kernel: K,
        graph: DependencyGraph,
        params: ParameterStore,
        options: PipelineOptions,
    ) -> ForgeResult<Self> {
        let graph = Arc::new(RwLock::new(graph));
        let params = Arc::new(RwLock::new(params));
        let dirty = Arc::new(Mutex::new(DirtySet::new()));
        let cache = ArtifactCache::new(options.cache);
        let progress = Arc::new(ProgressHub::new());

        let propagator =
            InvalidationPropagator::new(Arc::clone(&graph), Arc::clone(&params), Arc::clone(&dirty));
        let scheduler = BuildScheduler::new(
            SchedulerParts {
                graph: Arc::clone(&graph),
                params: Arc::clone(&params),
                dirty: Arc::clone(&dirty),
                cache: cache.clone(),
                kernel: Arc::new(kernel),
                progress: Arc::clone(&progress),
            },
            options.workers,
            options.max_reissues,
        )?;

        Ok(Self {
            graph,
            params,
            dirty,
            propagator,
            cache,
            progress,
            scheduler,
        })
    }

    /// Pipeline over the standard instrument graph and catalogue defaults
    pub fn for_instrument(kernel: K, options: PipelineOptions) -> ForgeResult<Self> {
        Self::new(
            kernel,
            instrument_graph()?,
            ParameterStore::with_catalog(),
            options,
        )
    }

    /// Apply one parameter edit
    pub fn set_parameter(
        &self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> ForgeResult<ParamChange> {
        self.propagator.on_parameter_change(name, value)
    }

    /// Apply several edits as one version
    pub fn set_parameters(&self, edits: Vec<(String, ParamValue)>) -> ForgeResult<ParamChange> {
        self.propagator.apply_batch(edits)
    }

    /// Current value of a parameter
    pub fn parameter(&self, name: &str) -> ForgeResult<Option<ParamValue>> {
        Ok(self.params.read()?.get(name).map(|p| p.value.clone()))
    }

    /// All parameters in name order
    pub fn parameters(&self) -> ForgeResult<Vec<Parameter>> {
        Ok(self.params.read()?.iter().cloned().collect())
    }

    /// Current parameter-store version
    pub fn params_version(&self) -> ForgeResult<u64> {
        Ok(self.params.read()?.version())
    }

    /// Build a node (and whatever it needs) and return its artifact
    pub async fn request_artifact(&self, node: &str) -> ForgeResult<ArtifactLease<K::Shape>> {
        self.scheduler.request(node).await
    }

    /// Build a node and report what happened to each node on the way
    pub async fn request_report(&self, node: &str) -> ForgeResult<BuildReport<K::Shape>> {
        self.scheduler.request_report(node).await
    }

    /// Receive progress events for `node`, or for every node if `None`
    pub fn subscribe_progress<F>(&self, node: Option<&str>, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress.subscribe(node, callback)
    }

    pub fn unsubscribe_progress(&self, id: SubscriptionId) -> bool {
        self.progress.unsubscribe(id)
    }

    /// Force every node to rebuild on its next request
    pub fn invalidate_all(&self) -> ForgeResult<u64> {
        let epoch = self.cache.invalidate_all();
        let marked = self.propagator.mark_all()?;
        info!("Invalidated all {} nodes (cache epoch {})", marked, epoch);
        Ok(epoch)
    }

    /// Add or replace a node; it and its dependents are marked dirty
    pub fn register_node(&self, node: BuildNode) -> ForgeResult<()> {
        let id = node.id.clone();
        self.graph.write()?.register(node)?;
        self.propagator.mark_dependents([id.as_str()])?;
        Ok(())
    }

    /// Remove a node nothing depends on
    pub fn remove_node(&self, id: &str) -> ForgeResult<BuildNode> {
        let removed = self.graph.write()?.remove(id)?;
        self.dirty.lock()?.clear(id, u64::MAX);
        self.scheduler.forget(id)?;
        Ok(removed)
    }

    /// Registered node ids in declaration order
    pub fn node_ids(&self) -> ForgeResult<Vec<String>> {
        Ok(self.graph.read()?.node_ids())
    }

    /// Build order for a node
    pub fn build_order(&self, root: &str) -> ForgeResult<Vec<String>> {
        self.graph.read()?.topological_order(root)
    }

    /// Build state of a node
    pub fn node_state(&self, id: &str) -> ForgeResult<Option<NodeState>> {
        self.scheduler.node_state(id)
    }

    /// Nodes awaiting revalidation
    pub fn dirty_nodes(&self) -> ForgeResult<Vec<String>> {
        Ok(self.dirty.lock()?.ids().into_iter().collect())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_entries(&self) -> Vec<EntryInfo> {
        self.cache.entries()
    }

    /// Drop idle cache entries
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Kernel worker threads
    pub fn worker_count(&self) -> usize {
        self.scheduler.worker_count()
    }

    /// Stop the worker pool after running builds finish
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
