//! End-to-end reconciliation over in-memory clusters

use fleet_api::{
    AppStatus, ChartRef, ClusterScopedWorkload, ClusterTarget, DesiredTopology,
    DesiredTopologySpec, PodSet, PodTemplate, ReplicaCount,
};
use fleet_cluster::{ClusterHandle, ClusterRegistry};
use fleet_core::store::{self, ListOptions};
use fleet_core::{BuiltinChart, ClusterClient, ComponentRegistry, MemoryClient};
use fleet_runtime::{Action, ObjectKey, Reconcile};
use fleet_topology::{TopologyReconciler, TopologySettings, WorkloadReconciler, WorkloadSettings};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use std::sync::Arc;
use std::time::Duration;

struct Fleet {
    host: Arc<MemoryClient>,
    clusters: Vec<Arc<MemoryClient>>,
    registry: Arc<ClusterRegistry>,
    topologies: TopologyReconciler,
    workloads: WorkloadReconciler,
}

fn pod_set(name: &str, replicas: i32) -> PodSet {
    PodSet {
        name: name.to_string(),
        replicas: ReplicaCount::Absolute(replicas),
        ..Default::default()
    }
}

fn topology(targets: Vec<(&str, Vec<PodSet>)>) -> DesiredTopology {
    let total: i32 = targets
        .iter()
        .flat_map(|(_, sets)| sets.iter())
        .map(|p| match p.replicas {
            ReplicaCount::Absolute(n) => n,
            ReplicaCount::Percent(_) => 0,
        })
        .sum();
    let mut topology = DesiredTopology::new(
        "web",
        DesiredTopologySpec {
            template: PodTemplate {
                image: "registry.local/web".to_string(),
                version: "v1".to_string(),
                replicas: Some(ReplicaCount::Absolute(total)),
                selector: [("app".to_string(), "web".to_string())].into(),
            },
            chart: ChartRef {
                name: "web".to_string(),
                version: "1.0.0".to_string(),
                kind: None,
            },
            targets: targets
                .into_iter()
                .map(|(cluster, pod_sets)| ClusterTarget {
                    cluster: cluster.to_string(),
                    pod_sets,
                })
                .collect(),
        },
    );
    topology.metadata.namespace = Some("shop".to_string());
    topology
}

fn key() -> ObjectKey {
    ObjectKey::new("shop", "web")
}

impl Fleet {
    async fn new(names: &[&str]) -> Self {
        let host = Arc::new(MemoryClient::new("host"));
        let registry = Arc::new(ClusterRegistry::new());
        let mut clusters = Vec::new();
        for name in names {
            let client = Arc::new(MemoryClient::new(*name));
            registry
                .add(Arc::new(ClusterHandle::new(*name, client.clone())))
                .await;
            clusters.push(client);
        }
        let topologies = TopologyReconciler::new(
            host.clone(),
            registry.clone(),
            ComponentRegistry::default(),
            TopologySettings::default(),
        );
        let workloads = WorkloadReconciler::new(
            registry.clone(),
            Arc::new(BuiltinChart),
            WorkloadSettings::default(),
        );
        Self {
            host,
            clusters,
            registry,
            topologies,
            workloads,
        }
    }

    fn cluster(&self, name: &str) -> &MemoryClient {
        self.clusters
            .iter()
            .find(|c| c.cluster_name() == name)
            .unwrap()
    }

    async fn reconcile_workloads(&self) {
        for client in &self.clusters {
            let cluster = client.cluster_name().to_string();
            self.workloads
                .reconcile(&ObjectKey::in_cluster(cluster, "shop", "web"))
                .await
                .unwrap();
        }
    }

    /// Mark every Deployment on every reachable cluster fully rolled out
    async fn settle(&self) {
        for client in &self.clusters {
            let Ok(deployments) =
                store::list::<Deployment>(client.as_ref(), None, &ListOptions::default()).await
            else {
                continue;
            };
            for mut deployment in deployments {
                let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                deployment.status = Some(DeploymentStatus {
                    observed_generation: deployment.metadata.generation,
                    replicas: Some(replicas),
                    ready_replicas: Some(replicas),
                    available_replicas: Some(replicas),
                    updated_replicas: Some(replicas),
                    ..Default::default()
                });
                store::update_status(client.as_ref(), &deployment).await.unwrap();
            }
        }
    }

    /// Run both tiers until the rollout has been reported back
    async fn converge(&self) -> Action {
        self.topologies.reconcile(&key()).await.unwrap();
        self.topologies.reconcile(&key()).await.unwrap();
        self.reconcile_workloads().await;
        self.settle().await;
        self.reconcile_workloads().await;
        self.topologies.reconcile(&key()).await.unwrap()
    }

    async fn topology(&self) -> Option<DesiredTopology> {
        store::get(self.host.as_ref(), "shop", "web").await.unwrap()
    }

    async fn deployments(&self, cluster: &str) -> Vec<String> {
        store::list::<Deployment>(self.cluster(cluster), None, &ListOptions::default())
            .await
            .unwrap()
            .into_iter()
            .filter_map(|d| d.metadata.name)
            .collect()
    }
}

#[tokio::test]
async fn test_two_clusters_converge_to_running() {
    let fleet = Fleet::new(&["a", "b"]).await;
    store::create(
        fleet.host.as_ref(),
        &topology(vec![("a", vec![pod_set("blue", 2)]), ("b", vec![pod_set("blue", 2)])]),
    )
    .await
    .unwrap();

    assert_eq!(fleet.converge().await, Action::Done);

    let topology = fleet.topology().await.unwrap();
    let status = topology.status.unwrap();
    assert_eq!((status.desired, status.available, status.unavailable), (4, 4, 0));
    assert_eq!(status.status, AppStatus::Running);
    assert_eq!(status.version, "v1");
    assert_eq!(status.observed_generation, topology.metadata.generation);
    assert_eq!(status.clusters.len(), 2);
    assert_eq!(fleet.deployments("a").await, vec!["web-blue"]);
    assert!(topology
        .metadata
        .finalizers
        .unwrap()
        .contains(&fleet_api::labels::TOPOLOGY_FINALIZER.to_string()));
}

#[tokio::test]
async fn test_second_pass_writes_nothing() {
    let fleet = Fleet::new(&["a", "b"]).await;
    store::create(
        fleet.host.as_ref(),
        &topology(vec![("a", vec![pod_set("blue", 2)]), ("b", vec![pod_set("blue", 2)])]),
    )
    .await
    .unwrap();
    fleet.converge().await;

    fleet.host.reset_writes();
    for client in &fleet.clusters {
        client.reset_writes();
    }
    fleet.topologies.reconcile(&key()).await.unwrap();
    fleet.reconcile_workloads().await;
    fleet.topologies.reconcile(&key()).await.unwrap();

    assert_eq!(fleet.host.writes(), 0);
    for client in &fleet.clusters {
        assert_eq!(client.writes(), 0);
    }
}

#[tokio::test]
async fn test_offline_cluster_is_excluded_from_status() {
    let fleet = Fleet::new(&["a", "b"]).await;
    store::create(
        fleet.host.as_ref(),
        &topology(vec![("a", vec![pod_set("blue", 2)]), ("b", vec![pod_set("blue", 2)])]),
    )
    .await
    .unwrap();
    fleet.converge().await;

    fleet.cluster("b").set_online(false);
    fleet.registry.probe_all(Duration::from_secs(1)).await;
    assert!(fleet.registry.get("b").await.unwrap_err().is_cluster_unavailable());

    let action = fleet.topologies.reconcile(&key()).await.unwrap();
    assert!(matches!(action, Action::RequeueAfter(_)));

    let status = fleet.topology().await.unwrap().status.unwrap();
    assert_eq!((status.desired, status.available), (2, 2));
    assert_eq!(status.status, AppStatus::Installing);
    assert_eq!(status.clusters.len(), 1);

    // Workloads on the offline cluster are skipped, not failed
    fleet
        .workloads
        .reconcile(&ObjectKey::in_cluster("b", "shop", "web"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_old_pod_set_survives_until_replacement_is_available() {
    let fleet = Fleet::new(&["a"]).await;
    store::create(fleet.host.as_ref(), &topology(vec![("a", vec![pod_set("blue", 2)])]))
        .await
        .unwrap();
    fleet.converge().await;

    let mut current = fleet.topology().await.unwrap();
    current.spec.targets[0].pod_sets = vec![pod_set("green", 2)];
    store::update(fleet.host.as_ref(), &current).await.unwrap();

    fleet.topologies.reconcile(&key()).await.unwrap();
    fleet.reconcile_workloads().await;
    let mut names = fleet.deployments("a").await;
    names.sort();
    assert_eq!(names, vec!["web-blue", "web-green"]);

    fleet.settle().await;
    fleet.reconcile_workloads().await;
    assert_eq!(fleet.deployments("a").await, vec!["web-green"]);

    let workload: ClusterScopedWorkload = store::get(fleet.cluster("a"), "shop", "web")
        .await
        .unwrap()
        .unwrap();
    let status = workload.status.unwrap();
    assert_eq!(status.status, AppStatus::Running);
    assert_eq!(status.pod_sets.len(), 1);
    assert_eq!(status.pod_sets[0].name, "green");
}

#[tokio::test]
async fn test_untargeted_cluster_child_is_pruned() {
    let fleet = Fleet::new(&["a", "b"]).await;
    store::create(
        fleet.host.as_ref(),
        &topology(vec![("a", vec![pod_set("blue", 2)]), ("b", vec![pod_set("blue", 2)])]),
    )
    .await
    .unwrap();
    fleet.converge().await;

    let mut current = fleet.topology().await.unwrap();
    current.spec.targets.retain(|t| t.cluster == "a");
    current.spec.template.replicas = Some(ReplicaCount::Absolute(2));
    store::update(fleet.host.as_ref(), &current).await.unwrap();

    fleet.topologies.reconcile(&key()).await.unwrap();
    let pruned: Option<ClusterScopedWorkload> =
        store::get(fleet.cluster("b"), "shop", "web").await.unwrap();
    assert!(pruned.is_none());
    // Owned manifests go with it
    assert!(fleet.deployments("b").await.is_empty());
}

#[tokio::test]
async fn test_deletion_removes_children_then_finalizer() {
    let fleet = Fleet::new(&["a", "b"]).await;
    store::create(
        fleet.host.as_ref(),
        &topology(vec![("a", vec![pod_set("blue", 2)]), ("b", vec![pod_set("blue", 2)])]),
    )
    .await
    .unwrap();
    fleet.converge().await;

    store::delete::<DesiredTopology>(fleet.host.as_ref(), "shop", "web")
        .await
        .unwrap();
    assert!(fleet.topology().await.unwrap().metadata.deletion_timestamp.is_some());

    assert_eq!(fleet.topologies.reconcile(&key()).await.unwrap(), Action::Done);
    assert!(fleet.topology().await.is_none());
    for cluster in ["a", "b"] {
        let child: Option<ClusterScopedWorkload> =
            store::get(fleet.cluster(cluster), "shop", "web").await.unwrap();
        assert!(child.is_none());
        assert!(fleet.deployments(cluster).await.is_empty());
    }
}

#[tokio::test]
async fn test_failing_cluster_fails_the_pass_without_rollback() {
    let fleet = Fleet::new(&["a", "b"]).await;
    store::create(
        fleet.host.as_ref(),
        &topology(vec![("a", vec![pod_set("blue", 2)]), ("b", vec![pod_set("blue", 2)])]),
    )
    .await
    .unwrap();
    // Finalizer pass
    fleet.topologies.reconcile(&key()).await.unwrap();

    fleet.cluster("b").inject_failures(1);
    let err = fleet.topologies.reconcile(&key()).await.unwrap_err();
    assert!(!err.is_permanent());

    // The reachable cluster keeps its child
    let written: Option<ClusterScopedWorkload> =
        store::get(fleet.cluster("a"), "shop", "web").await.unwrap();
    assert!(written.is_some());
    let missing: Option<ClusterScopedWorkload> =
        store::get(fleet.cluster("b"), "shop", "web").await.unwrap();
    assert!(missing.is_none());

    // The retry completes the fan-out
    fleet.topologies.reconcile(&key()).await.unwrap();
    for cluster in ["a", "b"] {
        let child: Option<ClusterScopedWorkload> =
            store::get(fleet.cluster(cluster), "shop", "web").await.unwrap();
        assert!(child.is_some());
    }
}

#[tokio::test]
async fn test_finalizer_stays_until_every_ready_cluster_confirms() {
    let fleet = Fleet::new(&["a", "b"]).await;
    store::create(
        fleet.host.as_ref(),
        &topology(vec![("a", vec![pod_set("blue", 2)]), ("b", vec![pod_set("blue", 2)])]),
    )
    .await
    .unwrap();
    fleet.converge().await;

    store::delete::<DesiredTopology>(fleet.host.as_ref(), "shop", "web")
        .await
        .unwrap();
    fleet.cluster("b").inject_failures(1);
    let err = fleet.topologies.reconcile(&key()).await.unwrap_err();
    assert!(!err.is_permanent());

    let pending = fleet.topology().await.unwrap();
    assert!(pending
        .metadata
        .finalizers
        .unwrap()
        .contains(&fleet_api::labels::TOPOLOGY_FINALIZER.to_string()));
    let survivor: Option<ClusterScopedWorkload> =
        store::get(fleet.cluster("b"), "shop", "web").await.unwrap();
    assert!(survivor.is_some());

    // Cluster b answers again
    assert_eq!(fleet.topologies.reconcile(&key()).await.unwrap(), Action::Done);
    assert!(fleet.topology().await.is_none());
    let gone: Option<ClusterScopedWorkload> =
        store::get(fleet.cluster("b"), "shop", "web").await.unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn test_invalid_replica_sum_is_permanent() {
    let fleet = Fleet::new(&["a"]).await;
    let mut invalid = topology(vec![("a", vec![pod_set("blue", 2)])]);
    invalid.spec.template.replicas = Some(ReplicaCount::Absolute(3));
    store::create(fleet.host.as_ref(), &invalid).await.unwrap();

    fleet.topologies.reconcile(&key()).await.unwrap();
    let err = fleet.topologies.reconcile(&key()).await.unwrap_err();
    assert!(err.is_permanent());
}
