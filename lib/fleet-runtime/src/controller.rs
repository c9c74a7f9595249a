//! Work-queue controller: a named queue drained by a pool of workers

use crate::key::ObjectKey;
use crate::queue::{ExponentialBackoff, WorkQueue};
use async_trait::async_trait;
use fleet_core::{CoreError, Metrics, Result};
use futures::future::join_all;
use futures::FutureExt;
use kube::Resource;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the object changes
    Done,
    /// Reconcile the key again after the delay
    RequeueAfter(Duration),
}

impl Action {
    pub fn requeue(delay: Duration) -> Self {
        Action::RequeueAfter(delay)
    }
}

/// Reconciles one key of a controller
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;
}

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub workers: usize,
    /// Transient failures retried per key before it is dropped
    pub max_requeues: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_requeues: 5,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

pub struct WorkQueueController {
    name: String,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
    settings: ControllerSettings,
    metrics: Option<Metrics>,
}

impl WorkQueueController {
    pub fn new(
        name: impl Into<String>,
        reconciler: Arc<dyn Reconcile>,
        settings: ControllerSettings,
    ) -> Self {
        let backoff = ExponentialBackoff::new(settings.base_backoff, settings.max_backoff);
        Self {
            name: name.into(),
            queue: Arc::new(WorkQueue::new(backoff)),
            reconciler,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Queue the key of `object`
    pub fn enqueue<K: Resource>(&self, object: &K) {
        self.enqueue_key(&ObjectKey::for_object(object));
    }

    pub fn enqueue_after<K: Resource>(&self, object: &K, delay: Duration) {
        self.enqueue_key_after(&ObjectKey::for_object(object), delay);
    }

    pub fn enqueue_key(&self, key: &ObjectKey) {
        if self.queue.add(key.to_string()) {
            debug!(controller = %self.name, key = %key, "Enqueued");
        }
        self.report_depth();
    }

    pub fn enqueue_key_after(&self, key: &ObjectKey, delay: Duration) {
        self.queue.add_after(key.to_string(), delay);
    }

    fn report_depth(&self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .queue_depth
                .with_label_values(&[&self.name])
                .set(self.queue.len() as f64);
        }
    }

    fn record(&self, result: &str, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics
                .reconcile_total
                .with_label_values(&[&self.name, result])
                .inc();
            metrics
                .reconcile_duration_seconds
                .with_label_values(&[&self.name])
                .observe(elapsed.as_secs_f64());
        }
    }

    fn record_drop(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .queue_dropped_total
                .with_label_values(&[&self.name, reason])
                .inc();
        }
    }

    /// Run the workers until `stop` fires, then shut the queue down and
    /// wait for in-flight items to finish
    pub async fn start(self: Arc<Self>, stop: CancellationToken) {
        info!(controller = %self.name, workers = self.settings.workers, "Starting controller");
        let workers: Vec<_> = (0..self.settings.workers.max(1))
            .map(|id| tokio::spawn(self.clone().run_worker(id)))
            .collect();

        stop.cancelled().await;
        self.queue.shut_down();
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(controller = %self.name, error = %e, "Worker task failed");
            }
        }
        info!(controller = %self.name, "Controller stopped");
    }

    async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(controller = %self.name, worker = id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
            self.report_depth();
        }
        debug!(controller = %self.name, worker = id, "Worker stopped");
    }

    async fn process(&self, raw_key: &str) {
        let key = match raw_key.parse::<ObjectKey>() {
            Ok(key) => key,
            Err(e) => {
                error!(controller = %self.name, key = %raw_key, error = %e, "Dropping malformed key");
                self.queue.forget(raw_key);
                self.record_drop("invalid_key");
                return;
            }
        };

        let span = info_span!("reconcile", controller = %self.name, key = %key);
        let started = Instant::now();
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(CoreError::Internal("reconcile panicked".to_string())));
        let elapsed = started.elapsed();

        match result {
            Ok(action) => {
                self.record("success", elapsed);
                self.queue.forget(raw_key);
                if let Action::RequeueAfter(delay) = action {
                    debug!(controller = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "Requeue requested");
                    self.queue.add_after(raw_key, delay);
                }
            }
            Err(e) if e.is_permanent() => {
                self.record("error", elapsed);
                error!(controller = %self.name, key = %key, error = %e, "Permanent error, dropping key");
                self.queue.forget(raw_key);
                self.record_drop("permanent");
            }
            Err(e) => {
                self.record("error", elapsed);
                let requeues = self.queue.num_requeues(raw_key);
                if requeues < self.settings.max_requeues {
                    let delay = self.queue.add_rate_limited(raw_key);
                    warn!(
                        controller = %self.name,
                        key = %key,
                        error = %e,
                        attempt = requeues + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Reconcile failed, requeueing"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.queue_retries_total.with_label_values(&[&self.name]).inc();
                    }
                } else {
                    error!(
                        controller = %self.name,
                        key = %key,
                        error = %e,
                        requeues = requeues,
                        "Retry budget exhausted, dropping key"
                    );
                    self.queue.forget(raw_key);
                    self.record_drop("max_requeues");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Transient,
        Permanent,
        RequeueOnce,
        Panic,
    }

    struct Counting {
        calls: AtomicUsize,
        behaviour: Behaviour,
    }

    impl Counting {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                behaviour,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reconcile for Counting {
        async fn reconcile(&self, _key: &ObjectKey) -> Result<Action> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(Action::Done),
                Behaviour::Transient => Err(CoreError::Transient("timeout".to_string())),
                Behaviour::Permanent => Err(CoreError::InvalidDesiredState("bad".to_string())),
                Behaviour::RequeueOnce if call == 0 => Ok(Action::requeue(Duration::from_secs(10))),
                Behaviour::RequeueOnce => Ok(Action::Done),
                Behaviour::Panic => panic!("boom"),
            }
        }
    }

    fn controller(reconciler: Arc<Counting>, max_requeues: u32) -> Arc<WorkQueueController> {
        let settings = ControllerSettings {
            workers: 2,
            max_requeues,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        };
        Arc::new(WorkQueueController::new("test", reconciler, settings))
    }

    async fn run_for(controller: &Arc<WorkQueueController>, duration: Duration) {
        let stop = CancellationToken::new();
        let task = tokio::spawn(controller.clone().start(stop.clone()));
        tokio::time::sleep(duration).await;
        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_enqueues_reconcile_once() {
        let reconciler = Counting::new(Behaviour::Succeed);
        let controller = controller(reconciler.clone(), 3);
        let key = ObjectKey::new("shop", "web");
        for _ in 0..5 {
            controller.enqueue_key(&key);
        }
        run_for(&controller, Duration::from_secs(1)).await;
        assert_eq!(reconciler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_retry_budget() {
        let reconciler = Counting::new(Behaviour::Transient);
        let controller = controller(reconciler.clone(), 3);
        controller.enqueue_key(&ObjectKey::new("shop", "web"));
        run_for(&controller, Duration::from_secs(30)).await;

        assert_eq!(reconciler.calls(), 4);
        assert_eq!(controller.queue().num_requeues("shop/web"), 0);
        assert!(controller.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_dropped() {
        let reconciler = Counting::new(Behaviour::Permanent);
        let controller = controller(reconciler.clone(), 3);
        controller.enqueue_key(&ObjectKey::new("shop", "web"));
        run_for(&controller, Duration::from_secs(30)).await;
        assert_eq!(reconciler.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_requeue_is_honoured() {
        let reconciler = Counting::new(Behaviour::RequeueOnce);
        let controller = controller(reconciler.clone(), 3);
        controller.enqueue_key(&ObjectKey::in_cluster("east", "shop", "web"));
        run_for(&controller, Duration::from_secs(5)).await;
        assert_eq!(reconciler.calls(), 1);

        let reconciler = Counting::new(Behaviour::RequeueOnce);
        let controller = self::controller(reconciler.clone(), 3);
        controller.enqueue_key(&ObjectKey::in_cluster("east", "shop", "web"));
        run_for(&controller, Duration::from_secs(11)).await;
        assert_eq!(reconciler.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_survives_panics() {
        let reconciler = Counting::new(Behaviour::Panic);
        let controller = controller(reconciler.clone(), 1);
        controller.enqueue_key(&ObjectKey::new("shop", "web"));
        controller.enqueue_key(&ObjectKey::new("shop", "api"));
        run_for(&controller, Duration::from_secs(5)).await;
        // Two keys, each tried once and retried once
        assert_eq!(reconciler.calls(), 4);
    }

    fn labelled_deployment(cluster: Option<&str>) -> k8s_openapi::api::apps::v1::Deployment {
        let mut deployment = k8s_openapi::api::apps::v1::Deployment::default();
        deployment.metadata.namespace = Some("shop".to_string());
        deployment.metadata.name = Some("web-blue".to_string());
        if let Some(cluster) = cluster {
            deployment.metadata.labels =
                Some([(fleet_api::labels::CLUSTER.to_string(), cluster.to_string())].into());
        }
        deployment
    }

    #[tokio::test]
    async fn test_enqueue_uses_cluster_label() {
        let controller = controller(Counting::new(Behaviour::Succeed), 3);
        controller.enqueue(&labelled_deployment(Some("a")));
        controller.enqueue(&labelled_deployment(Some("a")));
        controller.enqueue(&labelled_deployment(None));

        assert_eq!(controller.queue().len(), 2);
        assert_eq!(controller.queue().get().await.as_deref(), Some("a/shop/web-blue"));
        assert_eq!(controller.queue().get().await.as_deref(), Some("shop/web-blue"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_waits_and_dedups() {
        let controller = controller(Counting::new(Behaviour::Succeed), 3);
        let deployment = labelled_deployment(Some("a"));

        controller.enqueue_after(&deployment, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.queue().is_empty());

        // An immediate add lands first; the delayed one merges into it
        controller.enqueue(&deployment);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.queue().len(), 1);
        let key = controller.queue().get().await.unwrap();
        assert_eq!(key, "a/shop/web-blue");
        controller.queue().done(&key);
        assert!(controller.queue().is_empty());

        controller.enqueue_key_after(&ObjectKey::new("shop", "web"), Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.queue().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.queue().get().await.as_deref(), Some("shop/web"));
    }
}
