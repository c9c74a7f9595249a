//! Cluster registry: the ordered set of known clusters

use crate::handle::{ClusterHandle, ClusterStatus};
use fleet_core::{CoreError, Metrics, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default interval between liveness probes
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
/// Default timeout of a single liveness probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// ClusterRegistry keeps handles sorted by cluster name
pub struct ClusterRegistry {
    clusters: RwLock<Vec<Arc<ClusterHandle>>>,
    metrics: Option<Metrics>,
}

fn selects_all(filter: Option<&str>) -> bool {
    matches!(filter, None | Some("") | Some("all"))
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            clusters: RwLock::new(Vec::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(metrics: Metrics) -> Self {
        Self {
            clusters: RwLock::new(Vec::new()),
            metrics: Some(metrics),
        }
    }

    fn report(&self, handle: &ClusterHandle) {
        if let Some(metrics) = &self.metrics {
            metrics.set_cluster_ready(handle.name(), handle.is_ready());
        }
    }

    /// Register a handle. Returns false if a cluster with that name is
    /// already registered; the existing handle is kept.
    pub async fn add(&self, handle: Arc<ClusterHandle>) -> bool {
        let mut clusters = self.clusters.write().await;
        match clusters.binary_search_by(|c| c.name().cmp(handle.name())) {
            Ok(_) => false,
            Err(pos) => {
                info!(cluster = %handle.name(), origin = %handle.origin(), "Registered cluster");
                self.report(&handle);
                clusters.insert(pos, handle);
                true
            }
        }
    }

    /// Remove a cluster and stop its cache. Removing an unknown cluster is a no-op.
    pub async fn delete(&self, name: &str) -> Option<Arc<ClusterHandle>> {
        let mut clusters = self.clusters.write().await;
        let pos = clusters.binary_search_by(|c| c.name().cmp(name)).ok()?;
        let handle = clusters.remove(pos);
        handle.shutdown();
        if let Some(metrics) = &self.metrics {
            metrics.forget_cluster(name);
        }
        info!(cluster = %name, "Deregistered cluster");
        Some(handle)
    }

    /// Ready handle for `name`
    pub async fn get(&self, name: &str) -> Result<Arc<ClusterHandle>> {
        let clusters = self.clusters.read().await;
        let handle = clusters
            .binary_search_by(|c| c.name().cmp(name))
            .map(|pos| clusters[pos].clone())
            .map_err(|_| CoreError::ClusterNotFound(name.to_string()))?;
        if handle.is_ready() {
            Ok(handle)
        } else {
            Err(CoreError::ClusterOffline(name.to_string()))
        }
    }

    /// Every Ready handle, or only the named one. `None`, `""` and `"all"`
    /// select every cluster.
    pub async fn get_all(&self, filter: Option<&str>) -> Vec<Arc<ClusterHandle>> {
        let all = selects_all(filter);
        self.clusters
            .read()
            .await
            .iter()
            .filter(|c| c.is_ready())
            .filter(|c| all || Some(c.name()) == filter)
            .cloned()
            .collect()
    }

    /// Every handle regardless of status
    pub async fn handles(&self) -> Vec<Arc<ClusterHandle>> {
        self.clusters.read().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        self.clusters
            .read()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.clusters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clusters.read().await.is_empty()
    }

    /// Probe every cluster concurrently
    pub async fn probe_all(&self, timeout: Duration) {
        let handles = self.handles().await;
        let results = join_all(handles.iter().map(|h| h.probe(timeout))).await;
        for (handle, status) in handles.iter().zip(results) {
            self.report(handle);
            if status == ClusterStatus::Offline {
                debug!(cluster = %handle.name(), "Probe reported offline");
            }
        }
    }

    /// Probe every cluster at `interval` until `stop` fires
    pub fn spawn_health_checks(
        self: Arc<Self>,
        interval: Duration,
        timeout: Duration,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => self.probe_all(timeout).await,
                }
            }
            debug!("Health checks stopped");
        })
    }
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
