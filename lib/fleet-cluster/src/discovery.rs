//! Cluster discovery from static config and kubeconfig Secrets
//!
//! Clusters come from two sources: entries in the controller config
//! pointing at kubeconfig files, and Secrets on the host cluster labelled
//! `fleet.dev/cluster-config` carrying a `kubeconfig` key. Each sync adds
//! newly found clusters to the registry and removes discovered clusters
//! whose source vanished.

use crate::handle::ClusterHandle;
use crate::registry::{ClusterRegistry, DEFAULT_PROBE_TIMEOUT};
use async_trait::async_trait;
use fleet_api::labels;
use fleet_core::store::{self, ListOptions};
use fleet_core::{ClusterClient, CoreError, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ApiResource;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Secret key holding the kubeconfig document
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const STATIC_ORIGIN: &str = "static";
const SECRET_ORIGIN: &str = "secret";

/// A cluster declared in the controller config
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticCluster {
    pub name: String,
    pub kubeconfig: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Where and how often to look for clusters
#[derive(Clone, Debug)]
pub struct DiscoverySettings {
    /// Namespace holding kubeconfig Secrets; empty means all namespaces
    pub namespace: String,
    /// Label selecting kubeconfig Secrets
    pub label: String,
    pub interval: Duration,
    pub cache_sync_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            label: labels::CLUSTER_CONFIG.to_string(),
            interval: Duration::from_secs(30),
            cache_sync_timeout: Duration::from_secs(120),
        }
    }
}

/// A cluster found by a sync, before it is connected
#[derive(Clone, Debug)]
pub struct DiscoveredCluster {
    pub name: String,
    pub origin: String,
    pub kubeconfig: Kubeconfig,
    pub context: Option<String>,
}

/// Builds a handle for a discovered cluster
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cluster: &DiscoveredCluster) -> Result<Arc<ClusterHandle>>;
}

/// Connects to discovered clusters through their kubeconfig
pub struct KubeConnector {
    watched: Vec<ApiResource>,
}

impl KubeConnector {
    /// `watched` are the kinds cached on every connected cluster
    pub fn new(watched: Vec<ApiResource>) -> Self {
        Self { watched }
    }
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, cluster: &DiscoveredCluster) -> Result<Arc<ClusterHandle>> {
        let options = KubeConfigOptions {
            context: cluster.context.clone(),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(cluster.kubeconfig.clone(), &options)
            .await
            .map_err(|e| {
                CoreError::InvalidDesiredState(format!("cluster {} kubeconfig: {}", cluster.name, e))
            })?;
        let client = kube::Client::try_from(config)?;
        Ok(Arc::new(
            ClusterHandle::from_kube(cluster.name.clone(), client, self.watched.clone())
                .with_origin(cluster.origin.clone()),
        ))
    }
}

/// Keeps the registry in line with configured and discovered clusters
pub struct ClusterDiscovery {
    host: Option<Arc<dyn ClusterClient>>,
    statics: Vec<StaticCluster>,
    settings: DiscoverySettings,
    registry: Arc<ClusterRegistry>,
    connector: Arc<dyn Connector>,
}

fn discovered_origin(origin: &str) -> bool {
    origin == STATIC_ORIGIN || origin.starts_with(SECRET_ORIGIN)
}

impl ClusterDiscovery {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        connector: Arc<dyn Connector>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            host: None,
            statics: Vec::new(),
            settings,
            registry,
            connector,
        }
    }

    /// Look for kubeconfig Secrets on `host`
    pub fn with_host(mut self, host: Arc<dyn ClusterClient>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_static(mut self, statics: Vec<StaticCluster>) -> Self {
        self.statics = statics;
        self
    }

    fn load_static(&self) -> Vec<DiscoveredCluster> {
        let mut found = Vec::new();
        for entry in &self.statics {
            match Kubeconfig::read_from(&entry.kubeconfig) {
                Ok(kubeconfig) => found.push(DiscoveredCluster {
                    name: entry.name.clone(),
                    origin: STATIC_ORIGIN.to_string(),
                    kubeconfig,
                    context: entry.context.clone(),
                }),
                Err(e) => warn!(
                    cluster = %entry.name,
                    path = %entry.kubeconfig.display(),
                    error = %e,
                    "Failed to read kubeconfig"
                ),
            }
        }
        found
    }

    async fn load_secrets(&self) -> Result<Vec<DiscoveredCluster>> {
        let Some(host) = &self.host else {
            return Ok(Vec::new());
        };
        let namespace = Some(self.settings.namespace.as_str()).filter(|ns| !ns.is_empty());
        let secrets: Vec<Secret> = store::list(
            host.as_ref(),
            namespace,
            &ListOptions::default().labels(self.settings.label.clone()),
        )
        .await?;

        let mut found = Vec::new();
        for secret in secrets {
            let secret_name = secret.metadata.name.clone().unwrap_or_default();
            let namespace = secret.metadata.namespace.clone().unwrap_or_default();
            let Some(raw) = secret
                .data
                .as_ref()
                .and_then(|data| data.get(KUBECONFIG_KEY))
            else {
                warn!(secret = %store::object_key(&namespace, &secret_name), "Cluster secret without a kubeconfig key");
                continue;
            };
            let name = cluster_name(&secret_name, secret.metadata.labels.as_ref());
            let parsed = std::str::from_utf8(&raw.0)
                .map_err(|e| e.to_string())
                .and_then(|text| Kubeconfig::from_yaml(text).map_err(|e| e.to_string()));
            match parsed {
                Ok(kubeconfig) => found.push(DiscoveredCluster {
                    name,
                    origin: format!("{}:{}", SECRET_ORIGIN, store::object_key(&namespace, &secret_name)),
                    kubeconfig,
                    context: None,
                }),
                Err(e) => warn!(
                    secret = %store::object_key(&namespace, &secret_name),
                    error = %e,
                    "Invalid kubeconfig in cluster secret"
                ),
            }
        }
        Ok(found)
    }

    /// One discovery pass. Returns the names of clusters added and removed.
    pub async fn sync(&self, stop: &CancellationToken) -> Result<(Vec<String>, Vec<String>)> {
        let mut found = self.load_static();
        found.extend(self.load_secrets().await?);

        let mut wanted: BTreeMap<String, DiscoveredCluster> = BTreeMap::new();
        for cluster in found {
            if wanted.contains_key(&cluster.name) {
                warn!(cluster = %cluster.name, origin = %cluster.origin, "Duplicate cluster name, keeping the first");
                continue;
            }
            wanted.insert(cluster.name.clone(), cluster);
        }

        let mut removed = Vec::new();
        for handle in self.registry.handles().await {
            if discovered_origin(handle.origin()) && !wanted.contains_key(handle.name()) {
                self.registry.delete(handle.name()).await;
                removed.push(handle.name().to_string());
            }
        }

        let registered = self.registry.names().await;
        let mut added = Vec::new();
        for (name, cluster) in wanted {
            if registered.contains(&name) {
                continue;
            }
            let handle = match self.connector.connect(&cluster).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!(cluster = %name, error = %e, "Failed to connect to cluster");
                    continue;
                }
            };
            handle.probe(DEFAULT_PROBE_TIMEOUT).await;
            if self.registry.add(handle.clone()).await {
                spawn_cache(handle, stop.child_token(), self.settings.cache_sync_timeout);
                added.push(name);
            }
        }

        if !added.is_empty() || !removed.is_empty() {
            info!(added = ?added, removed = ?removed, "Cluster discovery changed the registry");
        }
        Ok((added, removed))
    }

    /// Sync every interval until `stop` fires
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        loop {
            if let Err(e) = self.sync(&stop).await {
                warn!(error = %e, "Cluster discovery failed, will retry");
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        debug!("Cluster discovery stopped");
    }
}

fn spawn_cache(handle: Arc<ClusterHandle>, stop: CancellationToken, timeout: Duration) {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, handle.start_cache(stop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(cluster = %handle.name(), error = %e, "Cache start failed"),
            Err(_) => warn!(cluster = %handle.name(), timeout_s = timeout.as_secs(), "Cache did not sync in time"),
        }
    });
}

/// Cluster name of a kubeconfig Secret: the `fleet.dev/cluster` label, or
/// the Secret name
fn cluster_name(secret_name: &str, secret_labels: Option<&BTreeMap<String, String>>) -> String {
    secret_labels
        .and_then(|l| l.get(labels::CLUSTER))
        .filter(|name| !name.is_empty())
        .cloned()
        .unwrap_or_else(|| secret_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::MemoryClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://remote.example:6443
contexts:
- name: remote
  context:
    cluster: remote
    user: admin
current-context: remote
users:
- name: admin
  user:
    token: abc
"#;

    /// Connects every cluster to an in-memory store
    struct MemoryConnector;

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, cluster: &DiscoveredCluster) -> Result<Arc<ClusterHandle>> {
            let client = Arc::new(MemoryClient::new(cluster.name.clone()));
            Ok(Arc::new(
                ClusterHandle::new(cluster.name.clone(), client).with_origin(cluster.origin.clone()),
            ))
        }
    }

    fn secret(name: &str, cluster: Option<&str>, kubeconfig: Option<&str>) -> Secret {
        let mut secret_labels =
            BTreeMap::from([(labels::CLUSTER_CONFIG.to_string(), "true".to_string())]);
        if let Some(cluster) = cluster {
            secret_labels.insert(labels::CLUSTER.to_string(), cluster.to_string());
        }
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("fleet-system".to_string()),
                labels: Some(secret_labels),
                ..Default::default()
            },
            data: kubeconfig.map(|k| {
                BTreeMap::from([(KUBECONFIG_KEY.to_string(), ByteString(k.as_bytes().to_vec()))])
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sync_adds_and_removes_secret_clusters() {
        let host = Arc::new(MemoryClient::new("host"));
        store::create(host.as_ref(), &secret("east-kubeconfig", Some("east"), Some(KUBECONFIG)))
            .await
            .unwrap();
        store::create(host.as_ref(), &secret("west", None, Some(KUBECONFIG)))
            .await
            .unwrap();
        store::create(host.as_ref(), &secret("broken", None, None))
            .await
            .unwrap();

        let registry = Arc::new(ClusterRegistry::new());
        // Registered by the host, never touched by discovery
        registry
            .add(Arc::new(ClusterHandle::new("local", host.clone()).with_origin("host")))
            .await;

        let settings = DiscoverySettings {
            namespace: "fleet-system".to_string(),
            ..Default::default()
        };
        let discovery = ClusterDiscovery::new(registry.clone(), Arc::new(MemoryConnector), settings)
            .with_host(host.clone());
        let stop = CancellationToken::new();

        let (added, removed) = discovery.sync(&stop).await.unwrap();
        assert_eq!(added, vec!["east", "west"]);
        assert!(removed.is_empty());
        assert_eq!(registry.names().await, vec!["east", "local", "west"]);

        // Second pass changes nothing
        let (added, removed) = discovery.sync(&stop).await.unwrap();
        assert!(added.is_empty() && removed.is_empty());

        store::delete::<Secret>(host.as_ref(), "fleet-system", "west").await.unwrap();
        let (_, removed) = discovery.sync(&stop).await.unwrap();
        assert_eq!(removed, vec!["west"]);
        assert_eq!(registry.names().await, vec!["east", "local"]);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_missing_static_kubeconfig_is_skipped() {
        let registry = Arc::new(ClusterRegistry::new());
        let discovery = ClusterDiscovery::new(
            registry.clone(),
            Arc::new(MemoryConnector),
            DiscoverySettings::default(),
        )
        .with_static(vec![StaticCluster {
            name: "gone".to_string(),
            kubeconfig: PathBuf::from("/nonexistent/kubeconfig"),
            context: None,
        }]);

        let (added, _) = discovery.sync(&CancellationToken::new()).await.unwrap();
        assert!(added.is_empty());
        assert!(registry.is_empty().await);
    }

    #[test]
    fn test_cluster_name_prefers_label() {
        let secret_labels = BTreeMap::from([(labels::CLUSTER.to_string(), "east".to_string())]);
        assert_eq!(cluster_name("east-kubeconfig", Some(&secret_labels)), "east");
        assert_eq!(cluster_name("west", None), "west");
    }
}
