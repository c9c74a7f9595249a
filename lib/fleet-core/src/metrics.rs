//! Prometheus metrics for controllers, queues and clusters

use crate::{CoreError, Result};
use prometheus::{Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics shared by every controller in the process
#[derive(Clone)]
pub struct Metrics {
    /// Reconcile passes by controller and result
    pub reconcile_total: IntCounterVec,
    /// Reconcile pass duration in seconds
    pub reconcile_duration_seconds: HistogramVec,
    /// Keys requeued after a transient failure
    pub queue_retries_total: IntCounterVec,
    /// Keys dropped from a queue, by reason
    pub queue_dropped_total: IntCounterVec,
    /// Keys waiting in a queue
    pub queue_depth: GaugeVec,
    /// 1 when a cluster is Ready, 0 when Offline
    pub cluster_ready: GaugeVec,
    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconcile_total = IntCounterVec::new(
            Opts::new("fleet_reconcile_total", "Reconcile passes"),
            &["controller", "result"],
        )
        .map_err(metrics_error)?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "fleet_reconcile_duration_seconds",
                "Reconcile pass latency in seconds",
            ),
            &["controller"],
        )
        .map_err(metrics_error)?;

        let queue_retries_total = IntCounterVec::new(
            Opts::new("fleet_queue_retries_total", "Keys requeued with backoff"),
            &["controller"],
        )
        .map_err(metrics_error)?;

        let queue_dropped_total = IntCounterVec::new(
            Opts::new("fleet_queue_dropped_total", "Keys dropped from the queue"),
            &["controller", "reason"],
        )
        .map_err(metrics_error)?;

        let queue_depth = GaugeVec::new(
            Opts::new("fleet_queue_depth", "Keys waiting in the queue"),
            &["controller"],
        )
        .map_err(metrics_error)?;

        let cluster_ready = GaugeVec::new(
            Opts::new("fleet_cluster_ready", "Cluster readiness (1 ready, 0 offline)"),
            &["cluster"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(reconcile_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(reconcile_duration_seconds.clone())).map_err(metrics_error)?;
        registry.register(Box::new(queue_retries_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(queue_dropped_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(queue_depth.clone())).map_err(metrics_error)?;
        registry.register(Box::new(cluster_ready.clone())).map_err(metrics_error)?;

        Ok(Self {
            reconcile_total,
            reconcile_duration_seconds,
            queue_retries_total,
            queue_dropped_total,
            queue_depth,
            cluster_ready,
            registry,
        })
    }

    pub fn set_cluster_ready(&self, cluster: &str, ready: bool) {
        self.cluster_ready
            .with_label_values(&[cluster])
            .set(if ready { 1.0 } else { 0.0 });
    }

    /// Stop reporting a cluster that left the registry
    pub fn forget_cluster(&self, cluster: &str) {
        let _ = self.cluster_ready.remove_label_values(&[cluster]);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer).map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| CoreError::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> CoreError {
    CoreError::Internal(format!("metrics: {}", e))
}
