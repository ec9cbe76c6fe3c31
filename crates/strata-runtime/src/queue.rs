//! Deduplicating work queue
//!
//! A key is in at most one of three places: waiting in `ready`, being
//! processed by a worker, or both processing and `dirty` (changed again while
//! a pass was running). A dirty key goes back to `ready` when its pass ends,
//! so passes for one key are serialized and no change is lost.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    scheduled: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            scheduled: HashMap::new(),
            shutting_down: false,
        }
    }
}

/// Work queue with per-key deduplication and delayed adds
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `key` unless it is already waiting
    ///
    /// A key that is being processed is marked dirty instead and re-queued
    /// once its current pass finishes.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Enqueue `key` after `delay`
    ///
    /// Only the earliest pending deadline per key is kept.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            match state.scheduled.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.scheduled.insert(key.clone(), deadline);
                }
            }
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.lock();
                if state.scheduled.get(&key) == Some(&deadline) {
                    state.scheduled.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Wait for the next key; `None` once the queue is shut down
    ///
    /// The caller owns the key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after a pass; re-queues it if it changed meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// True when no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a worker currently holds `key`
    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }
}
