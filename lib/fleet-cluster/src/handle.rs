//! One cached, health-tracked connection to a cluster

use fleet_core::store::KubeClusterClient;
use fleet_core::{ClusterClient, CoreError, Result};
use kube::api::ApiResource;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStatus {
    Ready,
    Offline,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterStatus::Ready => write!(f, "Ready"),
            ClusterStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// A registered cluster
pub struct ClusterHandle {
    name: String,
    origin: String,
    client: Arc<dyn ClusterClient>,
    status: RwLock<ClusterStatus>,
    synced: watch::Sender<bool>,
    stop: Mutex<Option<CancellationToken>>,
}

impl ClusterHandle {
    /// Handle over an arbitrary client, Ready until a probe says otherwise
    pub fn new(name: impl Into<String>, client: Arc<dyn ClusterClient>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            name: name.into(),
            origin: String::new(),
            client,
            status: RwLock::new(ClusterStatus::Ready),
            synced,
            stop: Mutex::new(None),
        }
    }

    /// Handle backed by an API server, caching the `watched` kinds
    pub fn from_kube(name: impl Into<String>, raw: kube::Client, watched: Vec<ApiResource>) -> Self {
        let name = name.into();
        let client = Arc::new(KubeClusterClient::new(name.clone(), raw, watched));
        Self::new(name, client)
    }

    /// Record where the handle came from (static config, a Secret, the host)
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    pub fn shared_client(&self) -> Arc<dyn ClusterClient> {
        self.client.clone()
    }

    pub fn status(&self) -> ClusterStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ClusterStatus::Ready
    }

    /// Set the status, returning the previous one
    pub fn set_status(&self, status: ClusterStatus) -> ClusterStatus {
        let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, status)
    }

    /// Start the watch-cache. Returns once the initial listing completed;
    /// watches stop when `stop` fires or the handle is shut down.
    pub async fn start_cache(&self, stop: CancellationToken) -> Result<()> {
        {
            let mut slot = self.stop.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(stop.clone());
        }
        self.client.start_cache(stop).await?;
        self.synced.send_replace(true);
        debug!(cluster = %self.name, "Cache synced");
        Ok(())
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the cache reports its initial sync
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> Result<()> {
        let mut synced = self.synced.subscribe();
        let result = match tokio::time::timeout(timeout, synced.wait_for(|s| *s)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CoreError::Internal(format!(
                "cluster {}: cache sync channel closed",
                self.name
            ))),
            Err(_) => Err(CoreError::Transient(format!(
                "cluster {}: cache not synced after {:?}",
                self.name, timeout
            ))),
        };
        result
    }

    /// Check liveness with a timeout and update the status accordingly
    pub async fn probe(&self, timeout: Duration) -> ClusterStatus {
        let status = match tokio::time::timeout(timeout, self.client.ping()).await {
            Ok(Ok(())) => ClusterStatus::Ready,
            Ok(Err(e)) => {
                debug!(cluster = %self.name, error = %e, "Liveness check failed");
                ClusterStatus::Offline
            }
            Err(_) => {
                debug!(cluster = %self.name, timeout_ms = timeout.as_millis() as u64, "Liveness check timed out");
                ClusterStatus::Offline
            }
        };

        let previous = self.set_status(status);
        if previous != status {
            match status {
                ClusterStatus::Ready => info!(cluster = %self.name, "Cluster back online"),
                ClusterStatus::Offline => warn!(cluster = %self.name, "Cluster went offline"),
            }
        }
        status
    }

    /// Stop the watch-cache
    pub fn shutdown(&self) {
        if let Some(stop) = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            stop.cancel();
        }
    }
}

impl fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("status", &self.status())
            .field("synced", &self.is_synced())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::MemoryClient;

    fn handle() -> (ClusterHandle, Arc<MemoryClient>) {
        let client = Arc::new(MemoryClient::new("east"));
        (ClusterHandle::new("east", client.clone()), client)
    }

    #[tokio::test]
    async fn test_probe_flips_status() {
        let (handle, client) = handle();
        assert!(handle.is_ready());

        client.set_online(false);
        assert_eq!(handle.probe(Duration::from_secs(1)).await, ClusterStatus::Offline);
        assert!(!handle.is_ready());

        client.set_online(true);
        assert_eq!(handle.probe(Duration::from_secs(1)).await, ClusterStatus::Ready);
    }

    #[tokio::test]
    async fn test_cache_sync_wait() {
        let (handle, _) = handle();
        let err = handle
            .wait_for_cache_sync(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));

        let stop = CancellationToken::new();
        handle.start_cache(stop.clone()).await.unwrap();
        assert!(handle.is_synced());
        handle.wait_for_cache_sync(Duration::from_millis(10)).await.unwrap();

        handle.shutdown();
        assert!(stop.is_cancelled());
    }
}
