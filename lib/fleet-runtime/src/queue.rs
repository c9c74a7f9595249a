//! De-duplicating, rate-limited work queue
//!
//! A key is queued at most once. A key handed to a worker is tracked as
//! processing; adding it again meanwhile marks it dirty and it is queued
//! again when the worker calls [`WorkQueue::done`], so no two workers ever
//! hold the same key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delay before the next retry of `key`; counts a failure
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(31);
        *count += 1;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures().get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &str) {
        self.failures().remove(key);
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(300))
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl WorkQueue {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key`. Returns false when it was already pending or the queue
    /// is shutting down.
    pub fn add(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return false;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Picked up again by done()
            return true;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Queue `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` after its backoff delay, counting a retry
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) -> Duration {
        let key = key.into();
        let delay = self.backoff.when(&key);
        self.add_after(key, delay);
        delay
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.backoff.num_requeues(key)
    }

    /// Clear retry bookkeeping for `key`
    pub fn forget(&self, key: &str) {
        self.backoff.forget(key);
    }

    /// Next key to process, or None once the queue is shutting down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
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

    /// Mark `key` as processed, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and release every waiting worker
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}
