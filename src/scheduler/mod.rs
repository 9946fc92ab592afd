//! Build scheduler
//!
//! A request for a node plans one pass over the node's dependency subgraph:
//!
//! 1. Snapshot the graph, the parameter store and the dirty set together.
//! 2. Fingerprint every node in topological order. Clean nodes reuse the
//!    fingerprint recorded by an earlier pass of the same graph generation.
//! 3. Dispatch nodes as their dependencies settle. Each node is served from
//!    the cache, attached to an identical in-flight build, or reserved and
//!    built on the worker pool. Independent nodes run concurrently.
//! 4. A failed node fails its dependents without a kernel call.
//!
//! If a parameter the subgraph reads changes while the pass runs, or the
//! graph or cache epoch moves, the pass stops dispatching and the request is
//! reissued. Builds already running are not interrupted: they commit under
//! the fingerprint they started with and stay available for reuse.

pub mod pool;
pub mod progress;

pub use pool::{resolve_worker_count, WorkerPool};
pub use progress::{ProgressEvent, ProgressHub, ProgressState, SubscriptionId};

use crate::cache::{ArtifactCache, ArtifactLease, Lookup};
use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::{fingerprint, resolve_params, Fingerprint};
use crate::graph::{BuildNode, DependencyGraph, NodeKind};
use crate::invalidate::DirtySet;
use crate::kernel::{GeometryKernel, ResolvedInputs};
use crate::params::{ParamSnapshot, ParamValue, ParameterStore};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Passes a single request may start before settling for the last result
pub const DEFAULT_MAX_REISSUES: usize = 8;

/// Per-node build state, as seen across requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Artifact is valid for the current inputs
    Clean,
    /// An edit may have changed the node's inputs
    NeedsFingerprint,
    /// Fingerprint changed and no artifact exists for it yet
    NeedsBuild,
    Building,
    /// Last build failed; retried after the next relevant edit
    Failed,
}

/// Status of one node's task within a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// Not dispatched because the pass was superseded
    Cancelled,
}

/// Where a settled node's artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSource {
    /// Built by this request
    Built,
    /// Already committed in the cache
    Cached,
    /// Built by a concurrent request this one waited on
    Shared,
}

/// Unit of work for one node in one pass.
///
/// Dependency artifacts are attached when the task is dispatched, in the
/// node's declared order.
#[derive(Debug, Clone)]
pub struct Task {
    pub node: String,
    pub fingerprint: Fingerprint,
    pub status: TaskStatus,
    pub source: Option<ArtifactSource>,
    pub error: Option<ForgeError>,
    dispatched: Option<Instant>,
    elapsed: Duration,
}

impl Task {
    fn new(node: &str, fingerprint: Fingerprint) -> Self {
        Self {
            node: node.to_string(),
            fingerprint,
            status: TaskStatus::Pending,
            source: None,
            error: None,
            dispatched: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Outcome of one node in the final pass of a request
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub fingerprint: Fingerprint,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ArtifactSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl From<&Task> for NodeReport {
    fn from(task: &Task) -> Self {
        Self {
            node: task.node.clone(),
            fingerprint: task.fingerprint,
            status: task.status,
            source: task.source,
            error: task.error.as_ref().map(ToString::to_string),
            elapsed_ms: u64::try_from(task.elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Result of a request together with what each node did
pub struct BuildReport<S> {
    pub root: String,
    pub result: ForgeResult<ArtifactLease<S>>,
    /// Nodes in build order
    pub nodes: Vec<NodeReport>,
    /// Passes started, including reissues
    pub passes: usize,
    /// Parameter-store version the result was built from
    pub params_version: u64,
    pub elapsed: Duration,
}

impl<S> BuildReport<S> {
    /// Nodes whose artifact came from `source`
    pub fn nodes_from(&self, source: ArtifactSource) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.source == Some(source))
            .map(|n| n.node.as_str())
            .collect()
    }

    /// Nodes that failed
    pub fn failed(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == TaskStatus::Failed)
            .map(|n| n.node.as_str())
            .collect()
    }

    pub fn into_result(self) -> ForgeResult<ArtifactLease<S>> {
        self.result
    }
}

#[derive(Debug, Clone)]
struct NodeRecord {
    fingerprint: Fingerprint,
    state: NodeState,
    error: Option<ForgeError>,
    generation: u64,
    epoch: u64,
    params_version: u64,
}

/// Everything one pass reads, captured at once
struct Plan {
    root: String,
    nodes: Vec<BuildNode>,
    index: HashMap<String, usize>,
    params: ParamSnapshot,
    dirty: HashSet<String>,
    generation: u64,
    epoch: u64,
}

impl Plan {
    fn position(&self, id: &str) -> ForgeResult<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| ForgeError::UnknownNode(id.to_string()))
    }

    fn is_newer_than(&self, record: &NodeRecord) -> bool {
        (self.generation, self.epoch, self.params.version)
            >= (record.generation, record.epoch, record.params_version)
    }
}

struct Pass<S> {
    tasks: Vec<Task>,
    artifacts: HashMap<usize, ArtifactLease<S>>,
    superseded: bool,
}

type NodeResult<S> = ForgeResult<(ArtifactLease<S>, ArtifactSource)>;
type NodeFuture<S> = Pin<Box<dyn Future<Output = (usize, NodeResult<S>)> + Send>>;

/// Shared state the scheduler operates on
pub struct SchedulerParts<K: GeometryKernel> {
    pub graph: Arc<RwLock<DependencyGraph>>,
    pub params: Arc<RwLock<ParameterStore>>,
    pub dirty: Arc<Mutex<DirtySet>>,
    pub cache: ArtifactCache<K::Shape>,
    pub kernel: Arc<K>,
    pub progress: Arc<ProgressHub>,
}

struct Core<K: GeometryKernel> {
    graph: Arc<RwLock<DependencyGraph>>,
    params: Arc<RwLock<ParameterStore>>,
    dirty: Arc<Mutex<DirtySet>>,
    cache: ArtifactCache<K::Shape>,
    kernel: Arc<K>,
    pool: WorkerPool<K>,
    progress: Arc<ProgressHub>,
    records: Mutex<HashMap<String, NodeRecord>>,
    max_reissues: usize,
}

/// Drives requests over the dependency graph
pub struct BuildScheduler<K: GeometryKernel> {
    core: Arc<Core<K>>,
}

impl<K: GeometryKernel> Clone for BuildScheduler<K> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K: GeometryKernel> BuildScheduler<K> {
    /// Create a scheduler with `workers` kernel threads (0 = one per core).
    ///
    /// A request whose inputs change mid-pass is reissued at most
    /// `max_reissues` times before the last pass's result is returned.
    pub fn new(
        parts: SchedulerParts<K>,
        workers: usize,
        max_reissues: usize,
    ) -> ForgeResult<Self> {
        let pool = WorkerPool::new(Arc::clone(&parts.kernel), workers)?;
        Ok(Self {
            core: Arc::new(Core {
                graph: parts.graph,
                params: parts.params,
                dirty: parts.dirty,
                cache: parts.cache,
                kernel: parts.kernel,
                pool,
                progress: parts.progress,
                records: Mutex::new(HashMap::new()),
                max_reissues,
            }),
        })
    }

    /// Number of kernel worker threads
    pub fn worker_count(&self) -> usize {
        self.core.pool.size()
    }

    /// Build `root` and everything it depends on
    pub async fn request(&self, root: &str) -> ForgeResult<ArtifactLease<K::Shape>> {
        self.request_report(root).await?.into_result()
    }

    /// Build `root` and report what happened to every node.
    ///
    /// The outer error covers planning failures (unknown node, missing
    /// parameter); build failures are in [`BuildReport::result`].
    pub async fn request_report(&self, root: &str) -> ForgeResult<BuildReport<K::Shape>> {
        let started = Instant::now();
        let mut passes = 0;

        loop {
            passes += 1;
            let plan = self.core.plan(root)?;
            let fingerprints = self.core.fingerprint_plan(&plan)?;
            let may_supersede = passes <= self.core.max_reissues;
            let mut pass = self.core.execute(&plan, &fingerprints, may_supersede).await;

            if pass.superseded {
                warn!(
                    "Inputs of {} changed during pass {}, reissuing",
                    root, passes
                );
                continue;
            }
            if self.core.is_stale(&plan) {
                warn!(
                    "Inputs of {} still changing after {} passes, returning version {}",
                    root, passes, plan.params.version
                );
            }

            let root_index = plan.position(root)?;
            let result = match pass.artifacts.remove(&root_index) {
                Some(lease) => Ok(lease),
                None => Err(pass.tasks[root_index]
                    .error
                    .clone()
                    .unwrap_or_else(|| ForgeError::BuildAbandoned {
                        node: root.to_string(),
                    })),
            };

            return Ok(BuildReport {
                root: root.to_string(),
                result,
                nodes: pass.tasks.iter().map(NodeReport::from).collect(),
                passes,
                params_version: plan.params.version,
                elapsed: started.elapsed(),
            });
        }
    }

    /// Current state of a node
    pub fn node_state(&self, id: &str) -> ForgeResult<Option<NodeState>> {
        if self.core.dirty.lock()?.is_dirty(id) {
            return Ok(Some(NodeState::NeedsFingerprint));
        }
        Ok(self.core.records.lock()?.get(id).map(|r| r.state))
    }

    /// Drop what the scheduler remembers about a removed node
    pub fn forget(&self, id: &str) -> ForgeResult<()> {
        self.core.records.lock()?.remove(id);
        Ok(())
    }

    /// Stop the worker pool, waiting for running builds
    pub fn shutdown(&self) {
        self.core.pool.shutdown();
    }
}

impl<K: GeometryKernel> Core<K> {
    /// Capture graph, parameters and dirty marks in lock order
    fn plan(&self, root: &str) -> ForgeResult<Plan> {
        let graph = self.graph.read()?;
        let order = graph.topological_order(root)?;
        let nodes = order
            .iter()
            .map(|id| {
                graph
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ForgeError::UnknownNode(id.clone()))
            })
            .collect::<ForgeResult<Vec<BuildNode>>>()?;
        let generation = graph.generation();
        let params = self.params.read()?.snapshot();
        let dirty: HashSet<String> = {
            let dirty = self.dirty.lock()?;
            order.iter().filter(|id| dirty.is_dirty(id)).cloned().collect()
        };
        let epoch = self.cache.epoch();
        drop(graph);

        let index = order
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        debug!(
            "Planned {} ({} nodes, {} dirty, version {}, generation {})",
            root,
            nodes.len(),
            dirty.len(),
            params.version,
            generation
        );
        Ok(Plan {
            root: root.to_string(),
            nodes,
            index,
            params,
            dirty,
            generation,
            epoch,
        })
    }

    /// Fingerprint every planned node, dependencies first
    fn fingerprint_plan(&self, plan: &Plan) -> ForgeResult<Vec<Fingerprint>> {
        let mut records = self.records.lock()?;
        let mut fingerprints: Vec<Fingerprint> = Vec::with_capacity(plan.nodes.len());

        for node in &plan.nodes {
            let reusable = records
                .get(&node.id)
                .filter(|r| {
                    !plan.dirty.contains(&node.id)
                        && r.generation == plan.generation
                        && r.epoch == plan.epoch
                })
                .map(|r| r.fingerprint);

            let fp = match reusable {
                Some(fp) => fp,
                None => {
                    let deps = node
                        .node_deps
                        .iter()
                        .map(|dep| plan.position(dep).map(|i| fingerprints[i]))
                        .collect::<ForgeResult<Vec<_>>>()?;
                    let params = resolve_params(node, &plan.params)?;
                    let fp = fingerprint(node, &params, &deps, plan.epoch)?;

                    if let Some(record) = records.get_mut(&node.id) {
                        if record.fingerprint != fp && record.state == NodeState::Clean {
                            record.state = NodeState::NeedsBuild;
                        }
                    }
                    debug!("Fingerprinted {} as {}", node.id, fp.short());
                    fp
                }
            };
            fingerprints.push(fp);
        }

        Ok(fingerprints)
    }

    /// Dispatch nodes as their dependencies settle
    async fn execute(
        self: &Arc<Self>,
        plan: &Plan,
        fingerprints: &[Fingerprint],
        may_supersede: bool,
    ) -> Pass<K::Shape> {
        let count = plan.nodes.len();
        let mut pass = Pass {
            tasks: plan
                .nodes
                .iter()
                .zip(fingerprints)
                .map(|(node, fp)| Task::new(&node.id, *fp))
                .collect(),
            artifacts: HashMap::new(),
            superseded: false,
        };

        let mut waiting: Vec<usize> = plan.nodes.iter().map(|n| n.node_deps.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (i, node) in plan.nodes.iter().enumerate() {
            for dep in &node.node_deps {
                if let Some(&j) = plan.index.get(dep) {
                    dependents[j].push(i);
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..count).filter(|&i| waiting[i] == 0).collect();
        let mut running: FuturesUnordered<NodeFuture<K::Shape>> = FuturesUnordered::new();

        loop {
            while let Some(i) = ready.pop_front() {
                pass.tasks[i].status = TaskStatus::Running;
                pass.tasks[i].dispatched = Some(Instant::now());
                running.push(self.dispatch(plan, i, &pass));
            }

            let Some((i, result)) = running.next().await else {
                break;
            };
            self.settle(plan, i, result, &mut pass);

            for &next in &dependents[i] {
                waiting[next] -= 1;
                if waiting[next] == 0 {
                    ready.push_back(next);
                }
            }

            if may_supersede && self.is_stale(plan) {
                pass.superseded = true;
                break;
            }
        }

        if pass.superseded {
            debug!(
                "Pass for {} superseded with {} build(s) still running",
                plan.root,
                running.len()
            );
            for task in &mut pass.tasks {
                if matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
                    task.status = TaskStatus::Cancelled;
                }
            }
        }
        pass
    }

    /// Start one node: fail fast, or fetch/build its artifact
    fn dispatch(self: &Arc<Self>, plan: &Plan, i: usize, pass: &Pass<K::Shape>) -> NodeFuture<K::Shape> {
        let node = &plan.nodes[i];
        let fp = pass.tasks[i].fingerprint;

        let failed_dep = node.node_deps.iter().find(|dep| {
            plan.index
                .get(*dep)
                .is_some_and(|&j| pass.tasks[j].status == TaskStatus::Failed)
        });
        if let Some(dep) = failed_dep {
            let err = ForgeError::DependencyFailed {
                node: node.id.clone(),
                dependency: dep.clone(),
            };
            debug!("Skipping {}: {}", node.id, err);
            self.progress.emit(&ProgressEvent::failed(&node.id, fp, &err));
            return settled(i, Err(err));
        }

        if !plan.dirty.contains(&node.id) {
            if let Some(err) = self.remembered_failure(&node.id, fp) {
                debug!("{} failed before with identical inputs", node.id);
                self.progress.emit(&ProgressEvent::failed(&node.id, fp, &err));
                return settled(i, Err(err));
            }
        }

        let mut dependencies = Vec::with_capacity(node.node_deps.len());
        for dep in &node.node_deps {
            let lease = plan
                .index
                .get(dep)
                .and_then(|j| pass.artifacts.get(j));
            match lease {
                Some(lease) => dependencies.push((dep.clone(), lease.clone())),
                None => {
                    return settled(
                        i,
                        Err(ForgeError::Internal(format!(
                            "{} dispatched before dependency {}",
                            node.id, dep
                        ))),
                    )
                }
            }
        }

        let params: BTreeMap<String, ParamValue> = match resolve_params(node, &plan.params) {
            Ok(params) => params.into_iter().map(|(k, v)| (k, v.clone())).collect(),
            Err(e) => return settled(i, Err(e)),
        };

        let core = Arc::clone(self);
        let id = node.id.clone();
        let kind = node.kind.clone();
        Box::pin(async move {
            let result = core.obtain(id, kind, fp, params, dependencies).await;
            (i, result)
        })
    }

    /// Serve a fingerprint from the cache, a concurrent build, or a new build
    async fn obtain(
        self: Arc<Self>,
        id: String,
        kind: NodeKind,
        fp: Fingerprint,
        params: BTreeMap<String, ParamValue>,
        dependencies: Vec<(String, ArtifactLease<K::Shape>)>,
    ) -> NodeResult<K::Shape> {
        loop {
            match self.cache.get_or_reserve(fp, &id) {
                Lookup::Hit(lease) => {
                    if self.kernel.is_alive(&lease) {
                        return Ok((lease, ArtifactSource::Cached));
                    }
                    warn!(
                        "Cached artifact of {} ({}) is no longer valid, rebuilding",
                        id,
                        fp.short()
                    );
                    self.cache.discard(&lease);
                }
                Lookup::InFlight(waiter) => {
                    return waiter
                        .wait()
                        .await
                        .map(|lease| (lease, ArtifactSource::Shared));
                }
                Lookup::Reserved(token) => {
                    self.set_building(&id, fp);
                    let inputs = ResolvedInputs::new(id.clone(), fp, params, dependencies);
                    // Spawned so the build commits even if this request is dropped.
                    let build = tokio::spawn(Arc::clone(&self).build(token, kind, inputs));
                    return match build.await {
                        Ok(result) => result.map(|lease| (lease, ArtifactSource::Built)),
                        Err(_) => Err(ForgeError::BuildAbandoned { node: id }),
                    };
                }
            }
        }
    }

    async fn build(
        self: Arc<Self>,
        token: crate::cache::BuildToken<K::Shape>,
        kind: NodeKind,
        inputs: ResolvedInputs<K::Shape>,
    ) -> ForgeResult<ArtifactLease<K::Shape>> {
        let node = inputs.node().to_string();
        let fp = token.fingerprint();
        self.progress.emit(&ProgressEvent::building(&node, fp));
        let started = Instant::now();

        match self.pool.execute(kind, inputs).await {
            Ok(shape) => {
                let weight = self.kernel.weight(&shape);
                let lease = token.commit(shape, weight);
                let elapsed = started.elapsed();
                info!("Built {} ({}) in {:?}", node, fp.short(), elapsed);
                self.progress.emit(&ProgressEvent::built(&node, fp, elapsed));
                Ok(lease)
            }
            Err(err) => {
                warn!("Build of {} failed: {}", node, err);
                token.abort(err.clone());
                self.progress.emit(&ProgressEvent::failed(&node, fp, &err));
                Err(err)
            }
        }
    }

    /// Record a settled node and clear its dirty mark
    fn settle(&self, plan: &Plan, i: usize, result: NodeResult<K::Shape>, pass: &mut Pass<K::Shape>) {
        let id = plan.nodes[i].id.clone();
        let task = &mut pass.tasks[i];
        if let Some(dispatched) = task.dispatched {
            task.elapsed = dispatched.elapsed();
        }

        let (state, error, revalidated) = match result {
            Ok((lease, source)) => {
                task.status = TaskStatus::Done;
                task.source = Some(source);
                pass.artifacts.insert(i, lease);
                (NodeState::Clean, None, true)
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error = Some(err.clone());
                // Only deterministic failures are remembered; anything else
                // is retried on the next request.
                let deterministic =
                    matches!(err, ForgeError::Kernel { .. } | ForgeError::DependencyFailed { .. });
                (NodeState::Failed, Some(err), deterministic)
            }
        };
        let fp = task.fingerprint;

        if !revalidated {
            return;
        }

        if let Ok(mut records) = self.records.lock() {
            let current = records.get(&id);
            if current.map_or(true, |r| plan.is_newer_than(r)) {
                records.insert(
                    id.clone(),
                    NodeRecord {
                        fingerprint: fp,
                        state,
                        error,
                        generation: plan.generation,
                        epoch: plan.epoch,
                        params_version: plan.params.version,
                    },
                );
            }
        }
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.clear(&id, plan.params.version);
        }
    }

    fn remembered_failure(&self, id: &str, fp: Fingerprint) -> Option<ForgeError> {
        let records = self.records.lock().ok()?;
        records
            .get(id)
            .filter(|r| r.state == NodeState::Failed && r.fingerprint == fp)
            .and_then(|r| r.error.clone())
    }

    fn set_building(&self, id: &str, fp: Fingerprint) {
        if let Ok(mut records) = self.records.lock() {
            if let Some(record) = records.get_mut(id) {
                if record.fingerprint != fp || record.state != NodeState::Clean {
                    record.state = NodeState::Building;
                }
            }
        }
    }

    /// Whether the plan no longer reflects the current inputs of its subgraph
    fn is_stale(&self, plan: &Plan) -> bool {
        let generation = match self.graph.read() {
            Ok(graph) => graph.generation(),
            Err(_) => return true,
        };
        if generation != plan.generation || self.cache.epoch() != plan.epoch {
            return true;
        }

        let Ok(params) = self.params.read() else {
            return true;
        };
        if params.version() == plan.params.version {
            return false;
        }
        plan.nodes
            .iter()
            .flat_map(|node| node.param_deps.iter())
            .any(|name| {
                params
                    .get(name)
                    .is_some_and(|p| p.version > plan.params.version)
            })
    }
}

fn settled<S: Send + Sync + 'static>(i: usize, result: NodeResult<S>) -> NodeFuture<S> {
    Box::pin(future::ready((i, result)))
}
