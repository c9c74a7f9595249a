//! Composition root: builds every component from the config and runs them
//! until the stop token fires

use crate::config::ControllerConfig;
use crate::server;
use crate::watch::{Filters, Router};
use anyhow::{Context, Result};
use fleet_api::{ClusterScopedWorkload, DesiredTopology};
use fleet_cluster::{ClusterDiscovery, ClusterRegistry, KubeConnector, DEFAULT_PROBE_TIMEOUT};
use fleet_core::store::{api_resource, ClusterClient};
use fleet_core::{BuiltinChart, ComponentRegistry, KubeClusterClient, Metrics};
use fleet_runtime::WorkQueueController;
use fleet_topology::{TopologyReconciler, TopologySettings, WorkloadReconciler, WorkloadSettings};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const HOST_CLUSTER: &str = "host";

pub struct Orchestrator {
    config: ControllerConfig,
}

impl Orchestrator {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    /// Start every component and block until `stop` fires and they have
    /// wound down
    pub async fn start(self, stop: CancellationToken) -> Result<()> {
        let config = self.config;
        let metrics = Metrics::new().context("Failed to create metrics")?;

        let raw = Client::try_default()
            .await
            .context("Failed to build the host cluster client")?;
        let host_client = KubeClusterClient::new(
            HOST_CLUSTER,
            raw,
            vec![api_resource::<DesiredTopology>(), api_resource::<Secret>()],
        );
        tokio::time::timeout(config.cache_sync_timeout(), host_client.start_cache(stop.child_token()))
            .await
            .context("Host cache did not sync in time")??;
        let host: Arc<dyn ClusterClient> = Arc::new(host_client);
        info!("Host cache synced");

        let registry = Arc::new(ClusterRegistry::with_metrics(metrics.clone()));
        let connector = Arc::new(KubeConnector::new(vec![
            api_resource::<ClusterScopedWorkload>(),
            api_resource::<Deployment>(),
            api_resource::<StatefulSet>(),
        ]));
        let discovery = Arc::new(
            ClusterDiscovery::new(registry.clone(), connector, config.discovery_settings())
                .with_host(host.clone())
                .with_static(config.clusters.clone()),
        );
        // First pass inline so the controllers start with the known clusters
        discovery
            .sync(&stop)
            .await
            .context("Initial cluster discovery failed")?;
        info!(clusters = ?registry.names().await, "Cluster registry populated");

        let settings = config.controller_settings();
        let topologies = Arc::new(
            WorkQueueController::new(
                "topologies",
                Arc::new(TopologyReconciler::new(
                    host.clone(),
                    registry.clone(),
                    ComponentRegistry::default(),
                    TopologySettings::default(),
                )),
                settings.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let workloads = Arc::new(
            WorkQueueController::new(
                "workloads",
                Arc::new(WorkloadReconciler::new(
                    registry.clone(),
                    Arc::new(BuiltinChart),
                    WorkloadSettings::default(),
                )),
                settings,
            )
            .with_metrics(metrics.clone()),
        );
        let router = Arc::new(Router::new(
            Filters::new(config.namespaces.clone()),
            topologies.clone(),
            workloads.clone(),
        ));

        let mut tasks = vec![
            tokio::spawn(topologies.clone().start(stop.clone())),
            tokio::spawn(workloads.clone().start(stop.clone())),
            tokio::spawn(discovery.clone().run(stop.clone())),
            registry
                .clone()
                .spawn_health_checks(config.health_interval(), DEFAULT_PROBE_TIMEOUT, stop.clone()),
            tokio::spawn(router.clone().follow(host.clone(), host.clone(), stop.clone())),
            tokio::spawn(router.clone().follow_registry(
                registry.clone(),
                host.clone(),
                config.discovery_settings().interval.min(config.health_interval()),
                stop.clone(),
            )),
        ];

        let metrics_addr = config.metrics_addr;
        let metrics_stop = stop.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(metrics_addr, metrics, metrics_stop).await {
                error!(error = %e, "Metrics server failed");
            }
        }));

        router.resync(host.as_ref()).await;
        info!(
            workers = config.workers,
            namespaces = ?config.namespaces,
            "Fleet controller started"
        );

        stop.cancelled().await;
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                error!(error = %e, "Task failed during shutdown");
            }
        }
        for handle in registry.handles().await {
            handle.shutdown();
        }
        info!("Fleet controller stopped");
        Ok(())
    }
}
