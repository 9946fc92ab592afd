//! Build progress notifications
//!
//! Subscribers register a callback for one node or for every node. Events
//! fire on `Building`, `Built` and `Failed` transitions. Callbacks run on
//! whichever thread produced the event, never while a hub lock is held, so a
//! callback may subscribe or unsubscribe.

use crate::fingerprint::Fingerprint;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Transition being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    Building,
    Built,
    Failed,
}

/// One state transition of one node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub node: String,
    pub fingerprint: Fingerprint,
    pub state: ProgressState,
    /// Build time, for `Built`
    pub elapsed: Option<Duration>,
    /// Failure message, for `Failed`
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn building(node: &str, fingerprint: Fingerprint) -> Self {
        Self {
            node: node.to_string(),
            fingerprint,
            state: ProgressState::Building,
            elapsed: None,
            error: None,
        }
    }

    pub fn built(node: &str, fingerprint: Fingerprint, elapsed: Duration) -> Self {
        Self {
            node: node.to_string(),
            fingerprint,
            state: ProgressState::Built,
            elapsed: Some(elapsed),
            error: None,
        }
    }

    pub fn failed(node: &str, fingerprint: Fingerprint, error: impl ToString) -> Self {
        Self {
            node: node.to_string(),
            fingerprint,
            state: ProgressState::Failed,
            elapsed: None,
            error: Some(error.to_string()),
        }
    }
}

/// Handle returned by [`ProgressHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    /// `None` receives events for every node
    node: Option<String>,
    callback: Callback,
}

/// Fan-out of progress events to subscribers
#[derive(Default)]
pub struct ProgressHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive events for `node`, or for every node if `None`
    pub fn subscribe<F>(&self, node: Option<&str>, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                node: node.map(str::to_string),
                callback: Arc::new(callback),
            });
        id
    }

    /// Stop a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver an event to matching subscribers
    pub fn emit(&self, event: &ProgressEvent) {
        let callbacks: Vec<Callback> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.node.as_deref().map_or(true, |n| n == event.node))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
