//! Watch wiring: cluster changes to work-queue keys
//!
//! Host DesiredTopology changes key the topology controller directly.
//! Changes on member clusters are mapped to their owners: a
//! ClusterScopedWorkload keys its own workload reconcile and the topology
//! named by its `fleet.dev/topology` label; a Deployment or StatefulSet keys
//! the workload named by its `fleet.dev/workload` label.

use fleet_api::{labels, ClusterScopedWorkload, DesiredTopology};
use fleet_cluster::ClusterRegistry;
use fleet_core::predicate::{self, Predicate};
use fleet_core::store::{self, ClusterClient, ListOptions};
use fleet_core::ObjectChange;
use fleet_runtime::{ObjectKey, WorkQueueController};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::Resource;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which controller a change is routed to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Topology(ObjectKey),
    Workload(ObjectKey),
}

/// Filters applied to changes before they are routed
pub struct Filters {
    topologies: Predicate,
    workloads: Predicate,
    pod_sets: Predicate,
}

impl Filters {
    pub fn new(namespaces: Vec<String>) -> Self {
        let scope = predicate::namespace_in(namespaces);
        Self {
            topologies: predicate::all_of(vec![scope.clone(), predicate::spec_changed()]),
            workloads: predicate::all_of(vec![
                scope.clone(),
                predicate::has_label(labels::TOPOLOGY),
                predicate::any_of(vec![predicate::spec_changed(), predicate::status_changed()]),
            ]),
            pod_sets: predicate::all_of(vec![
                scope,
                predicate::has_label(labels::WORKLOAD),
                predicate::any_of(vec![predicate::spec_changed(), predicate::status_changed()]),
            ]),
        }
    }

    fn accepts(&self, predicate: &Predicate, change: &ObjectChange) -> bool {
        if change.deleted {
            // Deletions carry no old state; only the scope and labels matter
            return predicate(None, &change.new);
        }
        predicate(change.old.as_ref(), &change.new)
    }

    /// Keys to enqueue for `change`
    pub fn route(&self, change: &ObjectChange) -> Vec<Route> {
        let object = &change.new;
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let label = |key: &str| {
            object
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(key))
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let kind = change.kind.as_str();
        if kind == DesiredTopology::kind(&()) {
            if !self.accepts(&self.topologies, change) {
                return Vec::new();
            }
            let name = object.metadata.name.clone().unwrap_or_default();
            return vec![Route::Topology(ObjectKey::new(namespace, name))];
        }
        if kind == ClusterScopedWorkload::kind(&()) {
            if !self.accepts(&self.workloads, change) {
                return Vec::new();
            }
            let name = object.metadata.name.clone().unwrap_or_default();
            let mut routes = vec![Route::Workload(ObjectKey::in_cluster(
                change.cluster.clone(),
                namespace.clone(),
                name,
            ))];
            if let Some(topology) = label(labels::TOPOLOGY) {
                routes.push(Route::Topology(ObjectKey::new(namespace, topology)));
            }
            return routes;
        }
        if kind == Deployment::kind(&()) || kind == StatefulSet::kind(&()) {
            if !self.accepts(&self.pod_sets, change) {
                return Vec::new();
            }
            return label(labels::WORKLOAD)
                .map(|workload| {
                    vec![Route::Workload(ObjectKey::in_cluster(
                        change.cluster.clone(),
                        namespace,
                        workload,
                    ))]
                })
                .unwrap_or_default();
        }
        Vec::new()
    }
}

/// Shared state of the watch loops
pub struct Router {
    filters: Filters,
    topologies: Arc<WorkQueueController>,
    workloads: Arc<WorkQueueController>,
}

impl Router {
    pub fn new(
        filters: Filters,
        topologies: Arc<WorkQueueController>,
        workloads: Arc<WorkQueueController>,
    ) -> Self {
        Self {
            filters,
            topologies,
            workloads,
        }
    }

    pub fn dispatch(&self, change: &ObjectChange) {
        for route in self.filters.route(change) {
            match route {
                Route::Topology(key) => self.topologies.enqueue_key(&key),
                Route::Workload(key) => self.workloads.enqueue_key(&key),
            }
        }
    }

    /// Enqueue every DesiredTopology on the host, used when the set of
    /// clusters changes or a subscription lagged
    pub async fn resync(&self, host: &dyn ClusterClient) {
        match store::list::<DesiredTopology>(host, None, &ListOptions::default()).await {
            Ok(topologies) => {
                for topology in &topologies {
                    self.topologies.enqueue(topology);
                }
                debug!(count = topologies.len(), "Resynced topologies");
            }
            Err(e) => warn!(error = %e, "Failed to list topologies for resync"),
        }
    }

    /// Forward changes from `client` until `stop` fires
    pub async fn follow(
        self: Arc<Self>,
        client: Arc<dyn ClusterClient>,
        host: Arc<dyn ClusterClient>,
        stop: CancellationToken,
    ) {
        let cluster = client.cluster_name().to_string();
        let mut changes = client.subscribe();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => self.dispatch(&change),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(cluster = %cluster, missed = missed, "Change subscription lagged, resyncing");
                        self.resync(host.as_ref()).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(cluster = %cluster, "Stopped following cluster changes");
    }

    /// Keep one follower per registered cluster, checking the registry every
    /// `interval`
    pub async fn follow_registry(
        self: Arc<Self>,
        registry: Arc<ClusterRegistry>,
        host: Arc<dyn ClusterClient>,
        interval: Duration,
        stop: CancellationToken,
    ) {
        let mut followers: HashMap<String, CancellationToken> = HashMap::new();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let handles = registry.handles().await;
            let mut changed = false;
            followers.retain(|name, token| {
                let present = handles.iter().any(|h| h.name() == name);
                if !present {
                    token.cancel();
                    info!(cluster = %name, "Cluster left, stopped following");
                    changed = true;
                }
                present
            });
            for handle in handles {
                if followers.contains_key(handle.name()) {
                    continue;
                }
                let token = stop.child_token();
                tokio::spawn(self.clone().follow(handle.shared_client(), host.clone(), token.clone()));
                followers.insert(handle.name().to_string(), token);
                info!(cluster = %handle.name(), "Following cluster changes");
                changed = true;
            }
            if changed {
                self.resync(host.as_ref()).await;
            }
        }
    }
}
