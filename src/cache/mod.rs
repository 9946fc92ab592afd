//! Content-addressed artifact cache
//!
//! Maps a [`Fingerprint`] to a committed artifact and guarantees at most one
//! concurrent build per fingerprint.
//!
//! # Lookup outcomes
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `Hit` | Committed entry, returned pinned |
//! | `Reserved` | Caller now owns the build and must commit or abort |
//! | `InFlight` | Another caller is building; wait for its result |
//!
//! Consumers hold an [`ArtifactLease`] for as long as they use an artifact.
//! A leased entry is never evicted. Failed builds are handed to every waiter
//! but never stored.

pub mod stats;

pub use stats::{format_bytes, mb_to_bytes, CacheSizeStatus, CacheStats};

use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::Fingerprint;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Size and lifetime limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Total artifact weight above which unpinned entries are evicted
    pub budget: Option<u64>,
    /// Unpinned entries idle this long are dropped by [`ArtifactCache::purge_expired`]
    pub max_idle: Option<Duration>,
}

/// Published state of one reservation
enum Slot<S> {
    Pending,
    Ready {
        artifact: Arc<S>,
        weight: u64,
        build_cost: Duration,
    },
    Failed(ForgeError),
}

impl<S> Clone for Slot<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending => Self::Pending,
            Self::Ready {
                artifact,
                weight,
                build_cost,
            } => Self::Ready {
                artifact: Arc::clone(artifact),
                weight: *weight,
                build_cost: *build_cost,
            },
            Self::Failed(e) => Self::Failed(e.clone()),
        }
    }
}

struct Entry<S> {
    /// Distinguishes a rebuilt entry from the one it replaced
    id: u64,
    node: String,
    artifact: Arc<S>,
    weight: u64,
    build_cost: Duration,
    last_access: Instant,
    last_use: u64,
    ref_count: usize,
}

/// Summary of one committed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub fingerprint: Fingerprint,
    pub node: String,
    pub weight: u64,
    pub build_cost: Duration,
    pub ref_count: usize,
}

struct State<S> {
    entries: HashMap<Fingerprint, Entry<S>>,
    inflight: HashMap<Fingerprint, watch::Sender<Slot<S>>>,
    policy: CachePolicy,
    epoch: u64,
    next_id: u64,
    tick: u64,
    total_weight: u64,
    hits: u64,
    misses: u64,
    coalesced: u64,
    evictions: u64,
    discarded: u64,
}

impl<S> State<S> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Pin an existing entry, or insert a new pinned one
    fn pin_or_insert(
        &mut self,
        fingerprint: Fingerprint,
        node: &str,
        artifact: Arc<S>,
        weight: u64,
        build_cost: Duration,
    ) -> (u64, Arc<S>) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(&fingerprint) {
            entry.ref_count += 1;
            entry.last_use = tick;
            entry.last_access = Instant::now();
            return (entry.id, Arc::clone(&entry.artifact));
        }

        self.next_id += 1;
        let id = self.next_id;
        self.total_weight = self.total_weight.saturating_add(weight);
        self.entries.insert(
            fingerprint,
            Entry {
                id,
                node: node.to_string(),
                artifact: Arc::clone(&artifact),
                weight,
                build_cost,
                last_access: Instant::now(),
                last_use: tick,
                ref_count: 1,
            },
        );
        (id, artifact)
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Entry<S>> {
        let entry = self.entries.remove(fingerprint)?;
        self.total_weight = self.total_weight.saturating_sub(entry.weight);
        Some(entry)
    }

    /// Evict least-recently-used unpinned entries until under budget
    fn evict_over_budget(&mut self) -> usize {
        let Some(budget) = self.policy.budget else {
            return 0;
        };

        let mut evicted = 0;
        while self.total_weight > budget {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| e.ref_count == 0)
                .min_by_key(|(_, e)| e.last_use)
                .map(|(fp, _)| *fp);
            let Some(fingerprint) = victim else {
                break;
            };
            if let Some(entry) = self.remove(&fingerprint) {
                debug!("Evicted {} ({})", entry.node, fingerprint.short());
            }
            self.evictions += 1;
            evicted += 1;
        }
        evicted
    }

    fn purge_idle(&mut self) -> usize {
        let Some(max_idle) = self.policy.max_idle else {
            return 0;
        };

        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0 && e.last_access.elapsed() >= max_idle)
            .map(|(fp, _)| *fp)
            .collect();
        for fingerprint in &expired {
            self.remove(fingerprint);
        }
        expired.len()
    }

    fn release(&mut self, fingerprint: &Fingerprint, entry_id: u64) {
        let released = match self.entries.get_mut(fingerprint) {
            Some(entry) if entry.id == entry_id => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count == 0
            }
            _ => false,
        };
        if released {
            self.evict_over_budget();
        }
    }
}

struct Shared<S> {
    state: Mutex<State<S>>,
}

impl<S> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, State<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of [`ArtifactCache::get_or_reserve`]
pub enum Lookup<S> {
    Hit(ArtifactLease<S>),
    Reserved(BuildToken<S>),
    InFlight(BuildWaiter<S>),
}

/// Shared, thread-safe artifact cache
pub struct ArtifactCache<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for ArtifactCache<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> Default for ArtifactCache<S> {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl<S> ArtifactCache<S> {
    /// Create an empty cache
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    inflight: HashMap::new(),
                    policy,
                    epoch: 0,
                    next_id: 0,
                    tick: 0,
                    total_weight: 0,
                    hits: 0,
                    misses: 0,
                    coalesced: 0,
                    evictions: 0,
                    discarded: 0,
                }),
            }),
        }
    }

    /// Return the committed artifact, reserve the build, or attach to the
    /// build already in flight for this fingerprint.
    ///
    /// The decision is made under one lock, so exactly one caller ever
    /// receives `Reserved` for a fingerprint until that token is released.
    pub fn get_or_reserve(&self, fingerprint: Fingerprint, node: &str) -> Lookup<S> {
        let mut state = self.shared.lock();
        let tick = state.next_tick();

        if let Some(entry) = state.entries.get_mut(&fingerprint) {
            entry.ref_count += 1;
            entry.last_use = tick;
            entry.last_access = Instant::now();
            let lease = ArtifactLease {
                fingerprint,
                entry_id: entry.id,
                artifact: Arc::clone(&entry.artifact),
                shared: Arc::clone(&self.shared),
            };
            state.hits += 1;
            debug!("Cache hit for {} ({})", node, fingerprint.short());
            return Lookup::Hit(lease);
        }

        if let Some(sender) = state.inflight.get(&fingerprint) {
            let rx = sender.subscribe();
            state.coalesced += 1;
            debug!("Waiting on in-flight build of {} ({})", node, fingerprint.short());
            return Lookup::InFlight(BuildWaiter {
                fingerprint,
                node: node.to_string(),
                rx,
                shared: Arc::clone(&self.shared),
            });
        }

        let (tx, _) = watch::channel(Slot::Pending);
        state.inflight.insert(fingerprint, tx);
        state.misses += 1;
        debug!("Reserved build of {} ({})", node, fingerprint.short());
        Lookup::Reserved(BuildToken {
            fingerprint,
            node: node.to_string(),
            shared: Arc::clone(&self.shared),
            started: Instant::now(),
            finished: false,
        })
    }

    /// Drop the entry behind a lease whose artifact is no longer usable.
    ///
    /// Returns false if the entry was already replaced or removed.
    pub fn discard(&self, lease: &ArtifactLease<S>) -> bool {
        let mut state = self.shared.lock();
        let matches = state
            .entries
            .get(&lease.fingerprint)
            .is_some_and(|e| e.id == lease.entry_id);
        if !matches {
            return false;
        }
        state.remove(&lease.fingerprint);
        state.discarded += 1;
        true
    }

    /// Drop unpinned entries that have been idle past the policy limit
    pub fn purge_expired(&self) -> usize {
        let purged = self.shared.lock().purge_idle();
        if purged > 0 {
            debug!("Purged {} idle cache entries", purged);
        }
        purged
    }

    /// Start a new cache epoch and drop every unpinned entry.
    ///
    /// Fingerprints are salted with the epoch, so pinned entries from older
    /// epochs are never hit again and age out once released.
    pub fn invalidate_all(&self) -> u64 {
        let mut state = self.shared.lock();
        state.epoch += 1;
        let unpinned: Vec<Fingerprint> = state
            .entries
            .iter()
            .filter(|(_, e)| e.ref_count == 0)
            .map(|(fp, _)| *fp)
            .collect();
        for fingerprint in &unpinned {
            state.remove(fingerprint);
        }
        info!(
            "Cache epoch {} started, dropped {} entries",
            state.epoch,
            unpinned.len()
        );
        state.epoch
    }

    /// Current cache epoch
    pub fn epoch(&self) -> u64 {
        self.shared.lock().epoch
    }

    /// Whether a committed entry exists for a fingerprint
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.shared.lock().entries.contains_key(fingerprint)
    }

    /// Number of committed entries
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Whether the cache holds no committed entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters and usage
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock();
        CacheStats {
            entries: state.entries.len(),
            pinned: state.entries.values().filter(|e| e.ref_count > 0).count(),
            inflight: state.inflight.len(),
            total_weight: state.total_weight,
            budget: state.policy.budget,
            hits: state.hits,
            misses: state.misses,
            coalesced: state.coalesced,
            evictions: state.evictions,
            discarded: state.discarded,
        }
    }

    /// Committed entries, most recently used first
    pub fn entries(&self) -> Vec<EntryInfo> {
        let state = self.shared.lock();
        let mut entries: Vec<(u64, EntryInfo)> = state
            .entries
            .iter()
            .map(|(fp, e)| {
                (
                    e.last_use,
                    EntryInfo {
                        fingerprint: *fp,
                        node: e.node.clone(),
                        weight: e.weight,
                        build_cost: e.build_cost,
                        ref_count: e.ref_count,
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        entries.into_iter().map(|(_, info)| info).collect()
    }
}

/// Exclusive right to build one fingerprint.
///
/// Dropping the token without calling [`commit`](Self::commit) or
/// [`abort`](Self::abort) fails every waiter with
/// [`ForgeError::BuildAbandoned`].
pub struct BuildToken<S> {
    fingerprint: Fingerprint,
    node: String,
    shared: Arc<Shared<S>>,
    started: Instant,
    finished: bool,
}

impl<S> BuildToken<S> {
    /// Fingerprint being built
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Store the artifact, wake all waiters and return it pinned
    pub fn commit(mut self, artifact: S, weight: u64) -> ArtifactLease<S> {
        self.finished = true;
        let build_cost = self.started.elapsed();

        let mut state = self.shared.lock();
        let sender = state.inflight.remove(&self.fingerprint);
        let (entry_id, artifact) = state.pin_or_insert(
            self.fingerprint,
            &self.node,
            Arc::new(artifact),
            weight,
            build_cost,
        );
        state.evict_over_budget();
        state.purge_idle();
        drop(state);

        if let Some(sender) = sender {
            sender.send_replace(Slot::Ready {
                artifact: Arc::clone(&artifact),
                weight,
                build_cost,
            });
        }
        debug!(
            "Committed {} ({}) after {:?}",
            self.node,
            self.fingerprint.short(),
            build_cost
        );

        ArtifactLease {
            fingerprint: self.fingerprint,
            entry_id,
            artifact,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Release the reservation and hand the failure to all waiters
    pub fn abort(mut self, error: ForgeError) {
        self.fail(error);
    }

    fn fail(&mut self, error: ForgeError) {
        self.finished = true;
        let sender = self.shared.lock().inflight.remove(&self.fingerprint);
        debug!("Aborted build of {}: {}", self.node, error);
        if let Some(sender) = sender {
            sender.send_replace(Slot::Failed(error));
        }
    }
}

impl<S> Drop for BuildToken<S> {
    fn drop(&mut self) {
        if !self.finished {
            let node = self.node.clone();
            self.fail(ForgeError::BuildAbandoned { node });
        }
    }
}

impl<S> fmt::Debug for BuildToken<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildToken")
            .field("node", &self.node)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Handle on another caller's in-flight build
pub struct BuildWaiter<S> {
    fingerprint: Fingerprint,
    node: String,
    rx: watch::Receiver<Slot<S>>,
    shared: Arc<Shared<S>>,
}

impl<S> BuildWaiter<S> {
    /// Wait for the builder to commit or abort
    pub async fn wait(mut self) -> ForgeResult<ArtifactLease<S>> {
        let slot = match self.rx.wait_for(|slot| !matches!(slot, Slot::Pending)).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => {
                return Err(ForgeError::BuildAbandoned {
                    node: self.node.clone(),
                })
            }
        };

        match slot {
            Slot::Ready {
                artifact,
                weight,
                build_cost,
            } => {
                // Re-pins the entry, or restores it if it was evicted between
                // the commit and this wake-up.
                let (entry_id, artifact) = self.shared.lock().pin_or_insert(
                    self.fingerprint,
                    &self.node,
                    artifact,
                    weight,
                    build_cost,
                );
                Ok(ArtifactLease {
                    fingerprint: self.fingerprint,
                    entry_id,
                    artifact,
                    shared: Arc::clone(&self.shared),
                })
            }
            Slot::Failed(error) => Err(error),
            Slot::Pending => Err(ForgeError::Internal(
                "build waiter woke without a result".to_string(),
            )),
        }
    }
}

/// A pinned artifact.
///
/// The cache entry cannot be evicted while any lease on it is alive.
/// Clones share the artifact and pin the entry independently.
pub struct ArtifactLease<S> {
    fingerprint: Fingerprint,
    entry_id: u64,
    artifact: Arc<S>,
    shared: Arc<Shared<S>>,
}

impl<S> ArtifactLease<S> {
    /// Fingerprint the artifact was built for
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The shared artifact handle
    pub fn artifact(&self) -> &Arc<S> {
        &self.artifact
    }

    /// Whether two leases refer to the same artifact handle
    pub fn same_artifact(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.artifact, &other.artifact)
    }
}

impl<S> Deref for ArtifactLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.artifact
    }
}

impl<S> Clone for ArtifactLease<S> {
    fn clone(&self) -> Self {
        let mut state = self.shared.lock();
        if let Some(entry) = state.entries.get_mut(&self.fingerprint) {
            if entry.id == self.entry_id {
                entry.ref_count += 1;
            }
        }
        drop(state);

        Self {
            fingerprint: self.fingerprint,
            entry_id: self.entry_id,
            artifact: Arc::clone(&self.artifact),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S> Drop for ArtifactLease<S> {
    fn drop(&mut self) {
        self.shared
            .lock()
            .release(&self.fingerprint, self.entry_id);
    }
}

impl<S> fmt::Debug for ArtifactLease<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactLease")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}
