//! Fan-out of a DesiredTopology into per-cluster ClusterScopedWorkloads

use crate::replicas::resolve_targets;
use fleet_api::labels;
use fleet_api::{
    ClusterScopedWorkload, ClusterScopedWorkloadSpec, DesiredTopology, PodSet, RenderedPodSet,
    ReplicaCount, WorkloadTopology,
};
use fleet_core::store::{self, ClusterClient};
use fleet_core::{with_optimistic_retry, ComponentRegistry, CoreError, OverrideInput, Result};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// The child a topology expects on one cluster
#[derive(Clone, Debug, PartialEq)]
pub struct ExpectedChild {
    pub cluster: String,
    pub workload: ClusterScopedWorkload,
}

impl ExpectedChild {
    pub fn namespace(&self) -> &str {
        self.workload.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.workload.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Labels identifying the child of `topology` on `cluster`
pub fn child_labels(topology: &str, cluster: &str) -> BTreeMap<String, String> {
    [
        (labels::TOPOLOGY.to_string(), topology.to_string()),
        (labels::CLUSTER.to_string(), cluster.to_string()),
        (labels::MANAGED_BY.to_string(), labels::MANAGER.to_string()),
    ]
    .into()
}

/// Whether `workload` was produced for the topology named `topology`
pub fn is_child_of(workload: &ClusterScopedWorkload, topology: &str) -> bool {
    workload.labels().get(labels::TOPOLOGY).map(String::as_str) == Some(topology)
}

/// Build the expected child for every target of `topology`
pub fn build_children(
    topology: &DesiredTopology,
    components: &ComponentRegistry,
) -> Result<Vec<ExpectedChild>> {
    let name = topology.name_any();
    let namespace = topology.namespace().unwrap_or_default();
    let spec = &topology.spec;
    let handler = components.resolve(spec.chart.kind.as_deref());

    let mut children = Vec::with_capacity(spec.targets.len());
    for target in resolve_targets(spec)? {
        let mut pod_sets = Vec::with_capacity(target.pod_sets.len());
        let mut rendered = Vec::with_capacity(target.pod_sets.len());
        for resolved in &target.pod_sets {
            let values = handler.overrides(&OverrideInput {
                chart: &spec.chart,
                template: &spec.template,
                pod_set: &resolved.pod_set,
                replicas: resolved.replicas,
            })?;
            rendered.push(RenderedPodSet {
                name: resolved.pod_set.name.clone(),
                values,
            });
            pod_sets.push(PodSet {
                replicas: ReplicaCount::Absolute(resolved.replicas),
                ..resolved.pod_set.clone()
            });
        }

        let mut workload = ClusterScopedWorkload::new(
            &name,
            ClusterScopedWorkloadSpec {
                replicas: target.replicas(),
                selector: spec.template.selector.clone(),
                chart: spec.chart.clone(),
                pod_sets,
                topology: WorkloadTopology { pod_sets: rendered },
            },
        );
        workload.metadata.namespace = Some(namespace.clone());
        workload.metadata.labels = Some(child_labels(&name, &target.cluster));
        debug!(topology = %name, cluster = %target.cluster, handler = %handler.name(), replicas = target.replicas(), "Built child");
        children.push(ExpectedChild {
            cluster: target.cluster,
            workload,
        });
    }
    Ok(children)
}

fn is_subset(expected: Option<&BTreeMap<String, String>>, live: Option<&BTreeMap<String, String>>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let empty = BTreeMap::new();
    let live = live.unwrap_or(&empty);
    expected.iter().all(|(k, v)| live.get(k) == Some(v))
}

/// Whether the live child differs from the expected one in labels,
/// annotations or spec. Status is never compared.
pub fn needs_update(expected: &ClusterScopedWorkload, live: &ClusterScopedWorkload) -> bool {
    !is_subset(expected.metadata.labels.as_ref(), live.metadata.labels.as_ref())
        || !is_subset(
            expected.metadata.annotations.as_ref(),
            live.metadata.annotations.as_ref(),
        )
        || expected.spec != live.spec
}

/// Create or update the expected child on `client`. Returns the number of
/// writes made (0 or 1).
pub async fn apply_child(
    client: &dyn ClusterClient,
    expected: &ExpectedChild,
    max_attempts: u32,
) -> Result<usize> {
    let namespace = expected.namespace();
    let name = expected.name();
    let cluster = expected.cluster.as_str();

    match store::get::<ClusterScopedWorkload>(client, namespace, name).await? {
        None => match store::create(client, &expected.workload).await {
            Ok(_) => {
                info!(cluster = %cluster, namespace = %namespace, name = %name, "Created cluster workload");
                return Ok(1);
            }
            Err(CoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        },
        Some(live) if !needs_update(&expected.workload, &live) => return Ok(0),
        Some(_) => {}
    }

    let desired = &expected.workload;
    let operation = format!("update cluster workload {}/{} on {}", namespace, name, cluster);
    let written = with_optimistic_retry(max_attempts, &operation, || async move {
        let Some(mut latest) = store::get_latest::<ClusterScopedWorkload>(client, namespace, name).await?
        else {
            store::create(client, desired).await?;
            return Ok::<usize, CoreError>(1);
        };
        if !needs_update(desired, &latest) {
            return Ok(0);
        }
        if let Some(expected) = &desired.metadata.labels {
            latest.labels_mut().extend(expected.clone());
        }
        if let Some(expected) = &desired.metadata.annotations {
            latest.annotations_mut().extend(expected.clone());
        }
        latest.spec = desired.spec.clone();
        store::update(client, &latest).await?;
        Ok(1)
    })
    .await?;

    if written > 0 {
        info!(cluster = %cluster, namespace = %namespace, name = %name, "Updated cluster workload");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::{ChartRef, ClusterTarget, DesiredTopologySpec, PodTemplate};
    use fleet_core::render::ChartValues;
    use fleet_core::MemoryClient;

    fn topology() -> DesiredTopology {
        let pod_set = |name: &str, replicas| PodSet {
            name: name.to_string(),
            replicas: ReplicaCount::Absolute(replicas),
            ..Default::default()
        };
        let mut topology = DesiredTopology::new(
            "web",
            DesiredTopologySpec {
                template: PodTemplate {
                    image: "registry.local/web".to_string(),
                    version: "v1".to_string(),
                    replicas: Some(ReplicaCount::Absolute(4)),
                    selector: [("app".to_string(), "web".to_string())].into(),
                },
                chart: ChartRef {
                    name: "web".to_string(),
                    version: "1.0.0".to_string(),
                    kind: None,
                },
                targets: vec![
                    ClusterTarget {
                        cluster: "a".to_string(),
                        pod_sets: vec![pod_set("blue", 1), pod_set("green", 1)],
                    },
                    ClusterTarget {
                        cluster: "b".to_string(),
                        pod_sets: vec![pod_set("blue", 2)],
                    },
                ],
            },
        );
        topology.metadata.namespace = Some("shop".to_string());
        topology
    }

    #[test]
    fn test_build_children() {
        let children = build_children(&topology(), &ComponentRegistry::default()).unwrap();
        assert_eq!(children.len(), 2);

        let a = &children[0];
        assert_eq!(a.cluster, "a");
        assert_eq!((a.namespace(), a.name()), ("shop", "web"));
        assert_eq!(a.workload.spec.replicas, 2);
        assert_eq!(a.workload.labels().get(labels::CLUSTER).map(String::as_str), Some("a"));
        assert!(is_child_of(&a.workload, "web"));

        let rendered = &a.workload.spec.topology.pod_sets;
        assert_eq!(rendered.len(), 2);
        let values = ChartValues::from_yaml(&rendered[1].values).unwrap();
        assert_eq!(values.replicas, 1);
        assert_eq!(values.selector.get(labels::POD_SET).map(String::as_str), Some("green"));
    }

    #[test]
    fn test_invalid_replicas_fail_the_build() {
        let mut topology = topology();
        topology.spec.template.replicas = Some(ReplicaCount::Absolute(5));
        assert!(build_children(&topology, &ComponentRegistry::default())
            .unwrap_err()
            .is_permanent());
    }

    #[tokio::test]
    async fn test_apply_child_is_idempotent() {
        let client = MemoryClient::new("a");
        let child = build_children(&topology(), &ComponentRegistry::default())
            .unwrap()
            .remove(0);

        assert_eq!(apply_child(&client, &child, 5).await.unwrap(), 1);
        assert_eq!(apply_child(&client, &child, 5).await.unwrap(), 0);
        assert_eq!(client.writes(), 1);

        let mut scaled = child.clone();
        scaled.workload.spec.replicas = 3;
        client.inject_conflicts(1);
        assert_eq!(apply_child(&client, &scaled, 5).await.unwrap(), 1);
        let live: ClusterScopedWorkload = store::get(&client, "shop", "web").await.unwrap().unwrap();
        assert_eq!(live.spec.replicas, 3);
    }

    #[tokio::test]
    async fn test_foreign_labels_do_not_trigger_updates() {
        let client = MemoryClient::new("a");
        let child = build_children(&topology(), &ComponentRegistry::default())
            .unwrap()
            .remove(0);
        apply_child(&client, &child, 5).await.unwrap();

        let mut live: ClusterScopedWorkload = store::get(&client, "shop", "web").await.unwrap().unwrap();
        live.labels_mut().insert("team".to_string(), "payments".to_string());
        store::update(&client, &live).await.unwrap();
        client.reset_writes();

        assert_eq!(apply_child(&client, &child, 5).await.unwrap(), 0);
        assert_eq!(client.writes(), 0);
    }
}
