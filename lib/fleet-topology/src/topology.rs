//! DesiredTopology reconciler
//!
//! Runs on the host cluster. One pass attaches the cleanup finalizer, fans
//! the topology out into one ClusterScopedWorkload per target cluster,
//! prunes children of clusters that are no longer targeted, and aggregates
//! the children's status back onto the topology.

use crate::aggregate::{aggregate, ChildReport};
use crate::fanout::{apply_child, build_children, is_child_of, ExpectedChild};
use async_trait::async_trait;
use fleet_api::labels::TOPOLOGY_FINALIZER;
use fleet_api::{AggregatedStatus, AppStatus, ClusterScopedWorkload, DesiredTopology};
use fleet_cluster::ClusterRegistry;
use fleet_core::store::{self, ClusterClient};
use fleet_core::{with_optimistic_retry, ComponentRegistry, CoreError, Result, DEFAULT_CONFLICT_ATTEMPTS};
use fleet_runtime::{Action, ObjectKey, Reconcile};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct TopologySettings {
    /// Attempt budget for conflicting writes
    pub max_attempts: u32,
    /// Delay before checking again that deleted children are gone
    pub deletion_requeue: Duration,
    /// Resync interval while a rollout is in progress
    pub installing_requeue: Duration,
}

impl Default for TopologySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONFLICT_ATTEMPTS,
            deletion_requeue: Duration::from_secs(5),
            installing_requeue: Duration::from_secs(30),
        }
    }
}

pub struct TopologyReconciler {
    host: Arc<dyn ClusterClient>,
    registry: Arc<ClusterRegistry>,
    components: ComponentRegistry,
    settings: TopologySettings,
}

fn has_finalizer(topology: &DesiredTopology) -> bool {
    topology
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == TOPOLOGY_FINALIZER))
}

impl TopologyReconciler {
    pub fn new(
        host: Arc<dyn ClusterClient>,
        registry: Arc<ClusterRegistry>,
        components: ComponentRegistry,
        settings: TopologySettings,
    ) -> Self {
        Self {
            host,
            registry,
            components,
            settings,
        }
    }

    async fn set_finalizer(&self, key: &ObjectKey, present: bool) -> Result<()> {
        let host = self.host.as_ref();
        let (namespace, name) = (key.namespace.as_str(), key.name.as_str());
        let operation = format!("finalizer {}", key);

        with_optimistic_retry(self.settings.max_attempts, &operation, || async move {
            let Some(mut latest) = store::get_latest::<DesiredTopology>(host, namespace, name).await?
            else {
                return Ok::<(), CoreError>(());
            };
            if has_finalizer(&latest) == present {
                return Ok(());
            }
            let finalizers = latest.metadata.finalizers.get_or_insert_with(Vec::new);
            if present {
                finalizers.push(TOPOLOGY_FINALIZER.to_string());
            } else {
                finalizers.retain(|f| f != TOPOLOGY_FINALIZER);
            }
            store::update(host, &latest).await?;
            Ok(())
        })
        .await
    }

    /// Delete the child in every Ready cluster; release the topology once
    /// every one of them confirms it is gone
    async fn finalize(&self, key: &ObjectKey, topology: &DesiredTopology) -> Result<Action> {
        if !has_finalizer(topology) {
            return Ok(Action::Done);
        }
        let clusters = self.registry.get_all(None).await;
        for handle in &clusters {
            if store::delete::<ClusterScopedWorkload>(handle.client(), &key.namespace, &key.name).await? {
                info!(cluster = %handle.name(), key = %key, "Deleting cluster workload");
            }
        }
        for handle in &clusters {
            let remaining =
                store::get_latest::<ClusterScopedWorkload>(handle.client(), &key.namespace, &key.name)
                    .await?;
            if remaining.is_some() {
                debug!(cluster = %handle.name(), key = %key, "Cluster workload still present");
                return Ok(Action::requeue(self.settings.deletion_requeue));
            }
        }
        self.set_finalizer(key, false).await?;
        info!(key = %key, clusters = clusters.len(), "Topology cleaned up");
        Ok(Action::Done)
    }

    /// Write every expected child, then prune children of clusters that are
    /// no longer targeted
    async fn apply_spec(&self, key: &ObjectKey, children: &[ExpectedChild]) -> Result<usize> {
        let mut writes = 0;
        for child in children {
            let handle = match self.registry.get(&child.cluster).await {
                Ok(handle) => handle,
                Err(e) if e.is_cluster_unavailable() => {
                    warn!(cluster = %child.cluster, key = %key, error = %e, "Skipping unavailable cluster");
                    continue;
                }
                Err(e) => return Err(e),
            };
            writes += apply_child(handle.client(), child, self.settings.max_attempts).await?;
        }

        let targeted: HashSet<&str> = children.iter().map(|c| c.cluster.as_str()).collect();
        for handle in self.registry.get_all(None).await {
            if targeted.contains(handle.name()) {
                continue;
            }
            let stale =
                store::get::<ClusterScopedWorkload>(handle.client(), &key.namespace, &key.name).await?;
            if stale.is_some_and(|w| is_child_of(&w, &key.name))
                && store::delete::<ClusterScopedWorkload>(handle.client(), &key.namespace, &key.name)
                    .await?
            {
                info!(cluster = %handle.name(), key = %key, "Pruned cluster workload of untargeted cluster");
                writes += 1;
            }
        }
        Ok(writes)
    }

    async fn report(&self, key: &ObjectKey, cluster: &str) -> ChildReport {
        let handle = match self.registry.get(cluster).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(cluster = %cluster, key = %key, error = %e, "Cluster not observed");
                return ChildReport::missing(cluster);
            }
        };
        match store::get::<ClusterScopedWorkload>(handle.client(), &key.namespace, &key.name).await {
            Ok(Some(workload)) => ChildReport::observed(cluster, workload),
            Ok(None) => ChildReport::missing(cluster),
            Err(e) => {
                warn!(cluster = %cluster, key = %key, error = %e, "Failed to read cluster workload");
                ChildReport::missing(cluster)
            }
        }
    }

    /// Aggregate child status and write it when it changed
    async fn apply_status(&self, key: &ObjectKey, topology: &DesiredTopology) -> Result<AggregatedStatus> {
        let mut reports = Vec::with_capacity(topology.spec.targets.len());
        for target in &topology.spec.targets {
            reports.push(self.report(key, &target.cluster).await);
        }
        let status = aggregate(&reports, topology.metadata.generation);
        if topology.status.as_ref() == Some(&status) {
            return Ok(status);
        }

        let host = self.host.as_ref();
        let (namespace, name) = (key.namespace.as_str(), key.name.as_str());
        let next = &status;
        let operation = format!("status {}", key);
        with_optimistic_retry(self.settings.max_attempts, &operation, || async move {
            let Some(mut latest) = store::get_latest::<DesiredTopology>(host, namespace, name).await?
            else {
                return Ok::<(), CoreError>(());
            };
            latest.status = Some(next.clone());
            store::update_status(host, &latest).await?;
            Ok(())
        })
        .await?;

        info!(
            key = %key,
            status = %status.status,
            desired = status.desired,
            available = status.available,
            version = %status.version,
            "Topology status updated"
        );
        Ok(status)
    }
}

#[async_trait]
impl Reconcile for TopologyReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(topology) =
            store::get::<DesiredTopology>(self.host.as_ref(), &key.namespace, &key.name).await?
        else {
            debug!(key = %key, "Topology gone");
            return Ok(Action::Done);
        };

        if topology.metadata.deletion_timestamp.is_some() {
            return self.finalize(key, &topology).await;
        }
        if !has_finalizer(&topology) {
            // The write re-triggers this key
            self.set_finalizer(key, true).await?;
            return Ok(Action::Done);
        }

        let children = build_children(&topology, &self.components)?;
        let writes = self.apply_spec(key, &children).await?;
        let status = self.apply_status(key, &topology).await?;
        debug!(key = %key, writes = writes, status = %status.status, "Reconciled topology");

        Ok(match status.status {
            AppStatus::Installing => Action::requeue(self.settings.installing_requeue),
            AppStatus::Running => Action::Done,
        })
    }
}
