use crate::{errors::ControllerError, utils::metric_name, work_queue::WorkQueue};

use log::{debug, error};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use std::sync::Arc;

const RETRY: &'static str = "retry";

/// Default number of requeues before a failing key is dropped.
pub(crate) const MAX_RETRY: u32 = 10;

/// Receives errors of keys which are given up on. Must not block.
pub(crate) trait ErrorObserver: Send + Sync {
    fn observe(&self, key: &str, error: &ControllerError);
}

/// Reports dropped keys through the log and a counter.
pub(crate) struct LogErrorObserver {
    dropped: Counter<u64>,
}

impl LogErrorObserver {
    pub(crate) fn new() -> Self {
        let meter: Meter = global::meter(RETRY);
        let dropped = meter
            .u64_counter(metric_name("dropped_keys"))
            .with_description("Count of keys dropped after failed reconciliation")
            .build();
        Self { dropped }
    }
}

impl ErrorObserver for LogErrorObserver {
    fn observe(&self, key: &str, e: &ControllerError) {
        error!("dropping {} out of the queue: {}", key, e);
        self.dropped
            .add(1, &[KeyValue::new("temporary", e.is_temporary())]);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// The key was added back with backoff.
    Requeue,
    /// The key was reported and forgotten.
    Drop,
}

/// Decides what happens to a key whose sync failed.
#[derive(Clone)]
pub(crate) struct RetryPolicy {
    max_retry: u32,
    observer: Arc<dyn ErrorObserver>,
}

impl RetryPolicy {
    pub(crate) fn new(max_retry: u32, observer: Arc<dyn ErrorObserver>) -> Self {
        Self {
            max_retry,
            observer,
        }
    }

    /// A key is requeued as long as it was requeued less than `max_retry`
    /// times, so it is synced at most `max_retry + 1` times in a row.
    pub(crate) fn decide(&self, num_requeues: u32, error: &ControllerError) -> RetryDecision {
        if error.is_temporary() && num_requeues < self.max_retry {
            RetryDecision::Requeue
        } else {
            RetryDecision::Drop
        }
    }

    pub(crate) fn handle_error(
        &self,
        queue: &WorkQueue,
        key: &str,
        error: &ControllerError,
    ) -> RetryDecision {
        let decision = self.decide(queue.num_requeues(key), error);
        match decision {
            RetryDecision::Requeue => {
                debug!("error syncing {}, requeuing: {}", key, error);
                queue.add_rate_limited(key);
            }
            RetryDecision::Drop => {
                self.observer.observe(key, error);
                queue.forget(key);
            }
        }
        decision
    }
}
