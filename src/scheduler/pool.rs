//! Bounded worker pool for kernel builds
//!
//! A fixed set of OS threads pulls build jobs from a shared queue. Kernel
//! calls block for as long as the construction takes, so they never run on
//! the async runtime's threads. Results come back through a oneshot channel
//! per job.

use crate::error::{ForgeError, ForgeResult, KernelError};
use crate::graph::NodeKind;
use crate::kernel::{GeometryKernel, ResolvedInputs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Fallback when the available parallelism cannot be determined
const DEFAULT_WORKERS: usize = 4;

struct Job<S> {
    kind: NodeKind,
    inputs: ResolvedInputs<S>,
    reply: oneshot::Sender<Result<S, KernelError>>,
}

/// Resolve a configured worker count (0 = one per available core)
pub fn resolve_worker_count(configured: usize) -> usize {
    match configured {
        0 => thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_WORKERS),
        n => n,
    }
}

/// Fixed-size pool of kernel worker threads
pub struct WorkerPool<K: GeometryKernel> {
    jobs: Mutex<Option<mpsc::Sender<Job<K::Shape>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl<K: GeometryKernel> WorkerPool<K> {
    /// Start `workers` threads (0 = one per available core)
    pub fn new(kernel: Arc<K>, workers: usize) -> ForgeResult<Self> {
        let size = resolve_worker_count(workers);
        let (tx, rx) = mpsc::channel::<Job<K::Shape>>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..size)
            .map(|index| spawn_worker(index, Arc::clone(&kernel), Arc::clone(&rx)))
            .collect::<ForgeResult<Vec<_>>>()?;

        info!("Started {} build workers", size);
        Ok(Self {
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            size,
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run one kernel build on a worker and wait for its result
    pub async fn execute(
        &self,
        kind: NodeKind,
        inputs: ResolvedInputs<K::Shape>,
    ) -> ForgeResult<K::Shape> {
        let node = inputs.node().to_string();
        let (reply, rx) = oneshot::channel();

        {
            let jobs = self.jobs.lock()?;
            let sender = jobs.as_ref().ok_or(ForgeError::WorkerPoolClosed)?;
            sender
                .send(Job {
                    kind,
                    inputs,
                    reply,
                })
                .map_err(|_| ForgeError::WorkerPoolClosed)?;
        }

        match rx.await {
            Ok(Ok(shape)) => Ok(shape),
            Ok(Err(e)) => Err(ForgeError::kernel(node, e)),
            Err(_) => Err(ForgeError::BuildAbandoned { node }),
        }
    }

    /// Stop accepting jobs and wait for the workers to drain the queue
    pub fn shutdown(&self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!("Build workers stopped");
    }
}

impl<K: GeometryKernel> Drop for WorkerPool<K> {
    fn drop(&mut self) {
        // Closing the queue lets idle workers exit; busy ones finish first.
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn spawn_worker<K: GeometryKernel>(
    index: usize,
    kernel: Arc<K>,
    jobs: Arc<Mutex<mpsc::Receiver<Job<K::Shape>>>>,
) -> ForgeResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("fretforge-worker-{}", index))
        .spawn(move || loop {
            let job = match jobs.lock() {
                Ok(rx) => rx.recv(),
                Err(_) => break,
            };
            let Ok(Job {
                kind,
                inputs,
                reply,
            }) = job
            else {
                break;
            };

            let node = inputs.node().to_string();
            debug!("Worker {} building {}", index, node);
            let result = panic::catch_unwind(AssertUnwindSafe(|| kernel.build(&kind, &inputs)))
                .unwrap_or_else(|_| {
                    Err(KernelError::new(format!(
                        "kernel panicked while building {}",
                        node
                    )))
                });

            // Release the dependency leases before waking the requester.
            drop(inputs);
            let _ = reply.send(result);
        })
        .map_err(|e| ForgeError::io(format!("spawning build worker {}", index), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::kernel::BuilderTable;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn inputs(node: &str) -> ResolvedInputs<String> {
        let fingerprint = Fingerprint::from_hex(&"2".repeat(64)).unwrap();
        ResolvedInputs::new(node, fingerprint, BTreeMap::new(), Vec::new())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_builds_in_parallel() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let kernel = BuilderTable::new().with(NodeKind::Nut, move |inputs: &ResolvedInputs<String>| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(inputs.node().to_string())
        });
        let pool = Arc::new(WorkerPool::new(Arc::new(kernel), 2).unwrap());

        let a = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.execute(NodeKind::Nut, inputs("a")).await }
        });
        let b = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.execute(NodeKind::Nut, inputs("b")).await }
        });

        assert_eq!(a.await.unwrap().unwrap(), "a");
        assert_eq!(b.await.unwrap().unwrap(), "b");
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn panicking_kernel_reports_kernel_error() {
        let kernel = BuilderTable::new().with(NodeKind::Body, |_: &ResolvedInputs<String>| {
            panic!("boolean union blew up")
        });
        let pool = WorkerPool::new(Arc::new(kernel), 1).unwrap();

        let err = pool.execute(NodeKind::Body, inputs("body")).await.unwrap_err();
        assert!(matches!(err, ForgeError::Kernel { .. }));

        // The worker survives the panic.
        let err = pool.execute(NodeKind::Body, inputs("body")).await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn closed_pool_rejects_jobs() {
        let kernel: BuilderTable<String> = BuilderTable::new();
        let pool = WorkerPool::new(Arc::new(kernel), 1).unwrap();
        pool.shutdown();

        let err = pool.execute(NodeKind::Nut, inputs("nut")).await.unwrap_err();
        assert!(matches!(err, ForgeError::WorkerPoolClosed));
    }

    #[test]
    fn zero_means_available_parallelism() {
        assert!(resolve_worker_count(0) >= 1);
        assert_eq!(resolve_worker_count(3), 3);
    }
}
