//! Deduplicating work queue with delayed, rate-limited and filtered enqueues
//!
//! A key is never processed by two workers at once: a key enqueued while it
//! is being processed is marked dirty and re-queued when its worker calls
//! [`WorkQueue::done`]. Filtered enqueues carry a predicate that is evaluated
//! when the key is popped, so a periodic re-run always looks at the freshest
//! state of the object instead of a value captured when it was scheduled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::controller::error::BackoffConfig;

/// Predicate deciding at pop time whether a filtered key is still wanted
pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Inner<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    filters: HashMap<T, Predicate<T>>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    backoff: BackoffConfig,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                filters: HashMap::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key for immediate processing
    ///
    /// An unconditional enqueue supersedes a pending filtered one.
    pub fn enqueue(&self, key: T) {
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            inner.filters.remove(&key);
            if !inner.dirty.insert(key.clone()) {
                return;
            }
            if inner.processing.contains(&key) {
                return;
            }
            inner.queue.push_back(key);
        }
        self.notify.notify_waiters();
    }

    /// Queue a key once `delay` has elapsed
    pub fn enqueue_after(self: &Arc<Self>, key: T, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.enqueue(key);
            }
        });
    }

    /// Queue a key after `delay`, to be processed only if `predicate` still
    /// holds when it is popped
    pub fn enqueue_filtered(self: &Arc<Self>, key: T, delay: Duration, predicate: Predicate<T>) {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.add_filtered(key, predicate);
            }
        });
    }

    fn add_filtered(&self, key: T, predicate: Predicate<T>) {
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            if inner.dirty.contains(&key) {
                // already pending; a pending filter is replaced, an
                // unconditional entry stays unconditional
                if inner.filters.contains_key(&key) {
                    inner.filters.insert(key, predicate);
                }
                return;
            }
            inner.dirty.insert(key.clone());
            inner.filters.insert(key.clone(), predicate);
            if inner.processing.contains(&key) {
                return;
            }
            inner.queue.push_back(key);
        }
        self.notify.notify_waiters();
    }

    /// Requeue after a failure with per-key exponential backoff; returns the delay
    ///
    /// `floor` is a lower bound for the delay, typically a driver-suggested
    /// retry interval.
    pub fn enqueue_rate_limited(self: &Arc<Self>, key: T, floor: Option<Duration>) -> Duration {
        let attempt = {
            let mut inner = self.lock();
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        let delay = self.backoff.delay_with_floor(attempt, floor);
        self.enqueue_after(key, delay);
        delay
    }

    /// Reset the failure count of a key
    pub fn forget(&self, key: &T) {
        self.lock().failures.remove(key);
    }

    /// Number of consecutive failures recorded for a key
    pub fn failures(&self, key: &T) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue is shut down
    ///
    /// The caller must call [`WorkQueue::done`] when finished with the key.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            let popped = {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                match inner.queue.pop_front() {
                    Some(key) => {
                        inner.dirty.remove(&key);
                        inner.processing.insert(key.clone());
                        let filter = inner.filters.remove(&key);
                        Some((key, filter))
                    }
                    None => None,
                }
            };

            match popped {
                Some((key, None)) => return Some(key),
                Some((key, Some(filter))) => {
                    if filter(&key) {
                        return Some(key);
                    }
                    self.done(&key);
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key as processed, re-queueing it if it was enqueued meanwhile
    pub fn done(&self, key: &T) {
        let requeued = {
            let mut inner = self.lock();
            inner.processing.remove(key);
            if inner.dirty.contains(key) && !inner.shutting_down {
                inner.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Stop handing out keys; pending and delayed keys are dropped
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys waiting to be popped
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
