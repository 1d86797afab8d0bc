use crate::{
    errors::ControllerError,
    reconciler::SyncHandler,
    retry::{RetryDecision, RetryPolicy},
    utils::metric_name,
    work_queue::WorkQueue,
};

use futures::{FutureExt, future::join_all};
use log::{debug, info, warn};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Instant};

/// Default number of concurrent workers.
pub(crate) const WORKERS: usize = 5;

const DISPATCHER: &'static str = "dispatcher";

struct Worker {
    queue: WorkQueue,
    handler: Arc<dyn SyncHandler>,
    retry: RetryPolicy,
    reconcile_count: Counter<u64>,
    reconcile_errors: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Worker {
    /// Process one key. Returns `false` once the queue is shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let start = Instant::now();
        let result = match AssertUnwindSafe(self.handler.sync(key.as_str()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ControllerError::Panicked(panic_message(panic.as_ref()))),
        };
        let duration = Instant::now() - start;
        let outcome = match result {
            Ok(()) => {
                self.queue.forget(key.as_str());
                "success"
            }
            Err(e) => {
                self.reconcile_errors.add(1, &[]);
                match self.retry.handle_error(&self.queue, key.as_str(), &e) {
                    RetryDecision::Requeue => "requeue",
                    RetryDecision::Drop => "drop",
                }
            }
        };
        let labels = &[KeyValue::new("outcome", outcome)];
        self.reconcile_count.add(1, labels);
        self.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        self.queue.done(key.as_str());
        true
    }

    async fn run(self: Arc<Self>, id: usize) {
        debug!("worker {} started", id);
        while self.process_next_item().await {}
        debug!("worker {} stopped", id);
    }
}

/// Fixed pool of workers syncing keys from a [`WorkQueue`].
pub(crate) struct Dispatcher {
    worker: Arc<Worker>,
    workers: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: WorkQueue,
        handler: Arc<dyn SyncHandler>,
        retry: RetryPolicy,
        workers: usize,
    ) -> Self {
        let meter: Meter = global::meter(DISPATCHER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of Service reconcile invocations")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of failed Service reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of Service objects in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            worker: Arc::new(Worker {
                queue,
                handler,
                retry,
                reconcile_count,
                reconcile_errors,
                reconcile_duration,
            }),
            workers,
        }
    }

    /// Run the workers until `shutdown` completes. Keys in flight are finished,
    /// everything still queued is discarded.
    pub(crate) async fn run(self, shutdown: impl Future<Output = ()>) {
        info!("starting {} workers", self.workers);
        let handles: Vec<_> = (0..self.workers)
            .map(|id| tokio::spawn(self.worker.clone().run(id)))
            .collect();
        shutdown.await;
        info!("shutting down, waiting for workers to finish");
        self.worker.queue.shut_down();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("worker terminated abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rate_limiter::default_controller_rate_limiter, reconciler::Reconciler,
        test_utils::{FakeCluster, RecordingObserver, service},
    };
    use async_trait::async_trait;
    use ingress_manager_apis::{ObjectKey, RouteTemplate, TRIGGER_ANNOTATION};
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };
    use tokio::{
        sync::{Notify, oneshot},
        time::timeout,
    };

    /// Fails every sync and counts the attempts.
    #[derive(Default)]
    struct AlwaysFailing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncHandler for AlwaysFailing {
        async fn sync(&self, _key: &str) -> Result<(), ControllerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ControllerError::Any(anyhow::anyhow!("unavailable")))
        }
    }

    /// Blocks every sync until released and records the keys seen.
    #[derive(Default)]
    struct Gated {
        started: Notify,
        release: Notify,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyncHandler for Gated {
        async fn sync(&self, key: &str) -> Result<(), ControllerError> {
            self.seen.lock().unwrap().push(key.to_string());
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl SyncHandler for Panicking {
        async fn sync(&self, key: &str) -> Result<(), ControllerError> {
            panic!("cannot sync {}", key);
        }
    }

    fn queue() -> WorkQueue {
        WorkQueue::new("test", default_controller_rate_limiter())
    }

    fn worker(
        queue: &WorkQueue,
        handler: Arc<dyn SyncHandler>,
        observer: Arc<RecordingObserver>,
    ) -> Arc<Worker> {
        Dispatcher::new(queue.clone(), handler, RetryPolicy::new(10, observer), 1).worker
    }

    #[tokio::test(start_paused = true)]
    async fn failing_key_is_dropped_after_max_retry() {
        let q = queue();
        let handler = Arc::new(AlwaysFailing::default());
        let observer = Arc::new(RecordingObserver::default());
        let w = worker(&q, handler.clone(), observer.clone());

        q.add("ns/svc1");
        for attempt in 1..=11 {
            assert!(w.process_next_item().await);
            assert_eq!(attempt, handler.calls.load(Ordering::SeqCst));
        }
        assert_eq!(vec!["ns/svc1".to_string()], observer.errors());
        assert_eq!(0, q.num_requeues("ns/svc1"));
        // No twelfth attempt is scheduled.
        assert!(timeout(Duration::from_secs(3600), q.get()).await.is_err());
        assert_eq!(11, handler.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn updates_during_processing_are_merged() {
        let q = queue();
        let handler = Arc::new(Gated::default());
        let w = worker(&q, handler.clone(), Arc::new(RecordingObserver::default()));

        q.add("ns/svc1");
        let first = tokio::spawn({
            let w = w.clone();
            async move { w.process_next_item().await }
        });
        handler.started.notified().await;
        q.add("ns/svc1");
        q.add("ns/svc1");
        assert_eq!(0, q.len());
        handler.release.notify_one();
        assert!(first.await.unwrap());

        assert_eq!(1, q.len());
        let second = tokio::spawn({
            let w = w.clone();
            async move { w.process_next_item().await }
        });
        handler.started.notified().await;
        handler.release.notify_one();
        assert!(second.await.unwrap());
        assert_eq!(0, q.len());
        assert_eq!(2, handler.seen.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_handled_like_errors() {
        let q = queue();
        let observer = Arc::new(RecordingObserver::default());
        let w = worker(&q, Arc::new(Panicking), observer);
        q.add("ns/svc1");
        assert!(w.process_next_item().await);
        // done was called and the key was requeued with backoff.
        assert_eq!(1, q.num_requeues("ns/svc1"));
        assert_eq!(Some("ns/svc1".to_string()), q.get().await);
    }

    #[tokio::test]
    async fn malformed_key_is_dropped_at_once() {
        let q = queue();
        let cluster = FakeCluster::new();
        let observer = Arc::new(RecordingObserver::default());
        let reconciler = Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            TRIGGER_ANNOTATION.to_string(),
            RouteTemplate::default(),
        );
        let w = worker(&q, Arc::new(reconciler), observer.clone());
        q.add("a/b/c");
        assert!(w.process_next_item().await);
        assert_eq!(vec!["a/b/c".to_string()], observer.errors());
        assert_eq!(0, q.num_requeues("a/b/c"));
        assert_eq!(0, q.len());
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure_is_retried() {
        let q = queue();
        let cluster = FakeCluster::new();
        cluster.put_service(service("ns", "svc1", true));
        cluster.fail_creates(true);
        let reconciler = Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            TRIGGER_ANNOTATION.to_string(),
            RouteTemplate::default(),
        );
        let w = worker(&q, Arc::new(reconciler), Arc::new(RecordingObserver::default()));

        q.add("ns/svc1");
        assert!(w.process_next_item().await);
        assert_eq!(1, q.num_requeues("ns/svc1"));

        cluster.fail_creates(false);
        assert!(w.process_next_item().await);
        assert!(cluster.ingress(&ObjectKey::new("ns", "svc1")).is_some());
        // Success resets the backoff.
        assert_eq!(0, q.num_requeues("ns/svc1"));
    }

    #[tokio::test]
    async fn pool_stops_on_shutdown() {
        let q = queue();
        let cluster = FakeCluster::new();
        for name in ["a", "b", "c", "d", "e", "f"] {
            cluster.put_service(service("ns", name, true));
        }
        let reconciler = Reconciler::new(
            cluster.clone(),
            cluster.clone(),
            cluster.clone(),
            TRIGGER_ANNOTATION.to_string(),
            RouteTemplate::default(),
        );
        let dispatcher = Dispatcher::new(
            q.clone(),
            Arc::new(reconciler),
            RetryPolicy::new(10, Arc::new(RecordingObserver::default())),
            WORKERS,
        );
        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(dispatcher.run(async move {
            let _ = stopped.await;
        }));
        for name in ["a", "b", "c", "d", "e", "f"] {
            q.add(format!("ns/{}", name).as_str());
        }
        timeout(Duration::from_secs(5), async {
            while cluster.calls().0 < 6 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        stop.send(()).unwrap();
        timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(q.is_shutting_down());
        q.add("ns/a");
        assert_eq!(None, q.get().await);
    }
}
