//! Change queue
//!
//! A deduplicating, rate-limited work queue. Handlers always re-read current
//! state, so a key only needs to be processed once per burst of changes:
//!
//! - a key added while it is already queued is coalesced,
//! - a key added while a worker holds it is queued again once, on `done`,
//!   so one key is never processed by two workers at the same time,
//! - failed keys come back after a per-key exponential delay.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::retry::{BackoffLimiter, RetryConfig};

/// namespace/name key of a Kubernetes object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of any Kubernetes resource
    pub fn from_resource<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Namespace or the empty string for cluster-scoped keys
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: BackoffLimiter<K>,
}

/// Deduplicating work queue with per-key backoff
///
/// Cloning is cheap and every clone refers to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    /// Create an empty queue
    pub fn new(name: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: BackoffLimiter::new(retry),
            }),
        }
    }

    /// Queue name used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue a key, coalescing with an already pending occurrence
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // re-queued by done()
            return;
        }
        trace!(queue = %self.inner.name, key = %key, "enqueued");
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue a key after `delay`
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue a key after its per-key backoff delay
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        trace!(queue = %self.inner.name, key = %key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
        self.add_after(key, delay);
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down. The caller must call
    /// [`done`](Self::done) (or one of the `ack_*` helpers) when finished.
    pub async fn dequeue(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking state so a concurrent add or
            // shutdown cannot slip between the check and the wait
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key as no longer being processed
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Reset the backoff history for a key
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    /// Finish a key that synced successfully
    pub fn ack_success(&self, key: &K) {
        self.forget(key);
        self.done(key);
    }

    /// Finish a key that failed and should be retried after backoff
    pub fn ack_retry(&self, key: &K) {
        self.done(key);
        self.add_rate_limited(key.clone());
    }

    /// Number of requeues since the key last succeeded
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Number of keys waiting to be dequeued
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop dispatching keys and wake every waiting worker
    ///
    /// Keys currently held by workers may finish; pending and delayed keys
    /// are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
