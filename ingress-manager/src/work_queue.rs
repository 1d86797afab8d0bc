use crate::{rate_limiter::RateLimiter, utils::metric_name};

use log::{debug, trace};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::Notify, time::sleep};

const WORK_QUEUE: &'static str = "work_queue";

#[derive(Default)]
struct QueueState {
    /// Keys in processing order. Every key in here is also in `dirty`.
    queue: VecDeque<String>,
    /// Keys waiting to be processed.
    dirty: HashSet<String>,
    /// Keys handed out by `get` and not yet marked `done`.
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter>,
    adds: Counter<u64>,
    retries: Counter<u64>,
}

/// Deduplicating, rate limited queue of `namespace/name` keys.
///
/// A key is never queued twice and never handed out to two workers at the same
/// time: a key added while it is being processed is parked until `done` is
/// called for it. The handle is cheap to clone, all clones share one queue.
#[derive(Clone)]
pub(crate) struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub(crate) fn new(name: &str, rate_limiter: impl RateLimiter + 'static) -> Self {
        let meter: Meter = global::meter(WORK_QUEUE);
        let adds = meter
            .u64_counter(metric_name("workqueue_adds"))
            .with_description("Count of keys added to the work queue")
            .build();
        let retries = meter
            .u64_counter(metric_name("workqueue_retries"))
            .with_description("Count of rate limited requeues")
            .build();
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Default::default(),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
                adds,
                retries,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Never held across an await and no invariant spans a panic point.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("name", self.inner.name.clone())]
    }

    /// Mark `key` as needing processing.
    pub(crate) fn add(&self, key: &str) {
        {
            let mut state = self.state();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                trace!("{}: {} is being processed, parked until done", self.inner.name, key);
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.inner.adds.add(1, &self.labels());
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub(crate) async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register as waiter before looking at the state so no wakeup is lost.
            notified.as_mut().enable();
            {
                let mut state = self.state();
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

    /// Mark `key` as processed. A key added again while in flight is queued now.
    pub(crate) fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` after `delay` has elapsed.
    pub(crate) fn add_after(&self, key: &str, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(key.as_str());
        });
    }

    /// Add `key` after the delay the rate limiter assigns to it.
    pub(crate) fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.rate_limiter.when(key);
        debug!(
            "{}: requeue {} in {:?} (attempt {})",
            self.inner.name,
            key,
            delay,
            self.num_requeues(key)
        );
        self.inner.retries.add(1, &self.labels());
        self.add_after(key, delay);
    }

    /// Stop rate limiting `key`, resetting its requeue count.
    pub(crate) fn forget(&self, key: &str) {
        self.inner.rate_limiter.forget(key);
    }

    pub(crate) fn num_requeues(&self, key: &str) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Number of keys ready to be handed out.
    pub(crate) fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Stop handing out keys. Pending and delayed keys are discarded, keys in
    /// flight may still be marked `done`.
    pub(crate) fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
