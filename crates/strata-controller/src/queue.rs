//! Deduplicating work queue with per-item backoff.
//!
//! An item is held at most once in the queue. While a worker holds an item
//! (between `get` and `done`) it is never handed to another worker; adds in
//! that window are remembered and the item is re-queued on `done`.

use crate::config::BackoffConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

struct QueueState<T> {
    queue: VecDeque<T>,
    queued: HashSet<T>,
    processing: HashSet<T>,
    dirty: HashSet<T>,
    failures: HashMap<T, u32>,
    shutdown: bool,
}

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff: BackoffConfig,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                failures: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Queue `item` unless it is already queued
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        if state.processing.contains(&item) {
            state.dirty.insert(item);
            return;
        }
        if state.queued.insert(item.clone()) {
            state.queue.push_back(item);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.queued.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release an item taken with `get`, re-queueing it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.remove(item) && !state.shutdown && state.queued.insert(item.clone()) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `item` after `delay`
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Queue `item` after its next backoff delay; returns the delay used
    pub fn add_rate_limited(self: &Arc<Self>, item: T) -> Duration {
        let failures = {
            let mut state = self.state.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.backoff.delay(failures - 1);
        debug!("Requeueing {:?} in {:?} (failure {})", item, delay, failures);
        self.add_after(item, delay);
        delay
    }

    /// Reset the failure count of `item`
    pub fn forget(&self, item: &T) {
        self.state.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Number of items waiting (not counting ones being processed)
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items; blocked `get` calls return `None`
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}
