//! Controller configuration
//!
//! Read from the YAML file named by `FLEET_CONFIG` when set. Every field has
//! a default, and a few can be overridden from the environment:
//!
//! ```yaml
//! workers: 4
//! maxRequeues: 5
//! namespaces: [shop]
//! discovery:
//!   namespace: fleet-system
//!   intervalSecs: 30
//! clusters:
//!   - name: edge-a
//!     kubeconfig: /etc/fleet/edge-a.yaml
//! metricsAddr: 0.0.0.0:9090
//! logFormat: json
//! ```

use anyhow::{Context, Result};
use fleet_api::labels;
use fleet_cluster::{DiscoverySettings, StaticCluster, DEFAULT_HEALTH_INTERVAL};
use fleet_runtime::ControllerSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

pub const CONFIG_ENV: &str = "FLEET_CONFIG";
const WORKERS_ENV: &str = "FLEET_WORKERS";
const METRICS_ADDR_ENV: &str = "FLEET_METRICS_ADDR";
const NAMESPACE_ENV: &str = "FLEET_NAMESPACE";
const LOG_FORMAT_ENV: &str = "FLEET_LOG_FORMAT";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    /// Namespace holding kubeconfig Secrets; empty means all namespaces
    pub namespace: String,
    pub label: String,
    pub interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            label: labels::CLUSTER_CONFIG.to_string(),
            interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Worker tasks per controller
    pub workers: usize,
    pub max_requeues: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub health_interval_secs: u64,
    pub cache_sync_timeout_secs: u64,
    pub discovery: DiscoveryConfig,
    /// Clusters reached through kubeconfig files
    pub clusters: Vec<StaticCluster>,
    /// DesiredTopology namespaces to act on; empty means all
    pub namespaces: Vec<String>,
    pub metrics_addr: SocketAddr,
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_requeues: 5,
            base_backoff_ms: 5,
            max_backoff_secs: 300,
            health_interval_secs: DEFAULT_HEALTH_INTERVAL.as_secs(),
            cache_sync_timeout_secs: 120,
            discovery: DiscoveryConfig::default(),
            clusters: Vec::new(),
            namespaces: Vec::new(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_format: LogFormat::Text,
        }
    }
}

impl ControllerConfig {
    /// Load from `FLEET_CONFIG` (defaults when unset), then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let mut config = match vars.get(CONFIG_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&vars)?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        Self::from_yaml(&raw).with_context(|| format!("Failed to parse config file {}", path))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        if let Some(workers) = vars.get(WORKERS_ENV) {
            self.workers = workers
                .parse()
                .with_context(|| format!("{} must be a number, got {:?}", WORKERS_ENV, workers))?;
        }
        if let Some(addr) = vars.get(METRICS_ADDR_ENV) {
            self.metrics_addr = addr
                .parse()
                .with_context(|| format!("{} must be host:port, got {:?}", METRICS_ADDR_ENV, addr))?;
        }
        if let Some(namespace) = vars.get(NAMESPACE_ENV) {
            self.discovery.namespace = namespace.clone();
        }
        if let Some(format) = vars.get(LOG_FORMAT_ENV) {
            self.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => anyhow::bail!("{} must be text or json, got {:?}", LOG_FORMAT_ENV, other),
            };
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.workers.max(1),
            max_requeues: self.max_requeues,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            namespace: self.discovery.namespace.clone(),
            label: self.discovery.label.clone(),
            interval: Duration::from_secs(self.discovery.interval_secs.max(1)),
            cache_sync_timeout: self.cache_sync_timeout(),
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }
}
