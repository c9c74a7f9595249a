//! ClusterScopedWorkload reconciler
//!
//! Keys are `cluster/namespace/name`. A pass renders every pod set of the
//! workload, applies the manifests on its cluster, recomputes the workload
//! status from the live Deployments and StatefulSets, and collects objects
//! the workload no longer renders once it is fully available.

use crate::aggregate::latest_warnings;
use crate::gc::{select_orphans, ResourceId};
use crate::version::merge_versions;
use async_trait::async_trait;
use fleet_api::labels;
use fleet_api::{AppStatus, ClusterScopedWorkload, PodSetStatusInfo, WarningEvent, WorkloadStatus};
use fleet_cluster::ClusterRegistry;
use fleet_core::store::{self, api_resource, ClusterClient, ListOptions};
use fleet_core::{
    with_optimistic_retry, ApplyOptions, ChartRenderer, CoreError, DesiredState, ResourceReconciler,
    Result, TypedManifest, DEFAULT_CONFLICT_ATTEMPTS,
};
use fleet_runtime::{Action, ObjectKey, Reconcile};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Event, Service};
use kube::api::ApiResource;
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct WorkloadSettings {
    pub max_attempts: u32,
    /// Warning events kept on the workload status
    pub warning_limit: usize,
    /// Resync interval while a rollout is in progress
    pub installing_requeue: Duration,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONFLICT_ATTEMPTS,
            warning_limit: crate::aggregate::MAX_WARNINGS,
            installing_requeue: Duration::from_secs(15),
        }
    }
}

/// A pod-running object rendered for a pod set
#[derive(Clone, Debug)]
struct RenderedWorkload {
    pod_set: String,
    kind: &'static str,
    name: String,
    replicas: i32,
}

fn manifest_replicas(manifest: &TypedManifest) -> i32 {
    match manifest {
        TypedManifest::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
        TypedManifest::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
        _ => None,
    }
    .unwrap_or(0)
}

fn live_version(object_labels: &BTreeMap<String, String>) -> String {
    object_labels.get(labels::VERSION).cloned().unwrap_or_default()
}

/// Status of a pod set from its live Deployment
pub fn deployment_status(pod_set: &str, deployment: &Deployment) -> PodSetStatusInfo {
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    let available = status.available_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    // A rollout the controller has not seen yet counts as unavailable
    let settled = status.observed_generation >= deployment.metadata.generation;
    let mut unavailable = status
        .unavailable_replicas
        .unwrap_or(0)
        .max(desired - available)
        .max(0);
    if !settled || updated < desired {
        unavailable = unavailable.max(desired - updated).max(1.min(desired));
    }
    PodSetStatusInfo {
        name: pod_set.to_string(),
        desired,
        available,
        unavailable,
        ready: status.ready_replicas.unwrap_or(0),
        updated,
        current: status.replicas.unwrap_or(0),
        version: live_version(deployment.labels()),
    }
}

/// Status of a pod set from its live StatefulSet
pub fn statefulset_status(pod_set: &str, statefulset: &StatefulSet) -> PodSetStatusInfo {
    let desired = statefulset.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = statefulset.status.clone().unwrap_or_default();
    let available = status.available_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let settled = status.observed_generation >= statefulset.metadata.generation;
    let mut unavailable = (desired - available).max(0);
    if !settled || updated < desired {
        unavailable = unavailable.max(desired - updated).max(1.min(desired));
    }
    PodSetStatusInfo {
        name: pod_set.to_string(),
        desired,
        available,
        unavailable,
        ready: status.ready_replicas.unwrap_or(0),
        updated,
        current: status.current_replicas.unwrap_or(0),
        version: live_version(statefulset.labels()),
    }
}

/// Sum pod-set statuses into a workload status
pub fn workload_status(
    pod_sets: Vec<PodSetStatusInfo>,
    warnings: Vec<WarningEvent>,
    generation: Option<i64>,
) -> WorkloadStatus {
    let total = |count: fn(&PodSetStatusInfo) -> i32| {
        pod_sets.iter().fold(0i32, |sum, p| sum.saturating_add(count(p)))
    };
    let desired = total(|p| p.desired);
    let available = total(|p| p.available);
    let unavailable = total(|p| p.unavailable);
    let version = merge_versions(pod_sets.iter().map(|p| p.version.as_str()));
    let status = if available == desired && unavailable == 0 {
        AppStatus::Running
    } else {
        AppStatus::Installing
    };
    WorkloadStatus {
        desired,
        available,
        unavailable,
        version,
        status,
        observed_generation: generation,
        pod_sets,
        warnings,
    }
}

fn warning_event(cluster: &str, event: &Event) -> WarningEvent {
    let object = &event.involved_object;
    let last_seen = event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
        .map(|t| t.to_rfc3339());
    WarningEvent {
        cluster: Some(cluster.to_string()),
        object: format!(
            "{}/{}",
            object.kind.as_deref().unwrap_or_default(),
            object.name.as_deref().unwrap_or_default()
        ),
        reason: event.reason.clone().unwrap_or_default(),
        message: event.message.clone().unwrap_or_default(),
        count: event.count.unwrap_or(1),
        last_seen,
    }
}

/// Whether `object` is `owner` or an object generated for it: a ReplicaSet
/// or StatefulSet pod (`web-blue-0`, `web-blue-7d9f8`) or a Deployment pod
/// (`web-blue-7d9f8-x2kqz`)
fn owns_object(owner: &str, object: &str) -> bool {
    if object == owner {
        return true;
    }
    let Some(rest) = object.strip_prefix(owner).and_then(|r| r.strip_prefix('-')) else {
        return false;
    };
    let segments: Vec<&str> = rest.split('-').collect();
    segments.len() <= 2
        && segments
            .iter()
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Kinds the workload renders, searched by orphan collection
fn collected_kinds() -> [ApiResource; 4] {
    [
        api_resource::<Deployment>(),
        api_resource::<StatefulSet>(),
        api_resource::<Service>(),
        api_resource::<HorizontalPodAutoscaler>(),
    ]
}

pub struct WorkloadReconciler {
    registry: Arc<ClusterRegistry>,
    renderer: Arc<dyn ChartRenderer>,
    settings: WorkloadSettings,
}

impl WorkloadReconciler {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        renderer: Arc<dyn ChartRenderer>,
        settings: WorkloadSettings,
    ) -> Self {
        Self {
            registry,
            renderer,
            settings,
        }
    }

    /// Render and apply every pod set. Returns the owned objects and the
    /// pod-running ones among them.
    async fn apply_manifests(
        &self,
        client: &dyn ClusterClient,
        workload: &ClusterScopedWorkload,
    ) -> Result<(HashSet<ResourceId>, Vec<RenderedWorkload>)> {
        let name = workload.name_any();
        let namespace = workload.namespace().unwrap_or_default();
        let owner = workload.controller_owner_ref(&()).ok_or_else(|| {
            CoreError::Internal(format!("cluster workload {}/{} has no uid", namespace, name))
        })?;

        let mut owned = HashSet::new();
        let mut workloads = Vec::new();
        for pod_set in &workload.spec.topology.pod_sets {
            let release = format!("{}-{}", name, pod_set.name);
            let manifests =
                self.renderer
                    .render(&workload.spec.chart, &release, &namespace, &pod_set.values)?;
            let autoscaled = manifests
                .iter()
                .any(|m| matches!(m, TypedManifest::HorizontalPodAutoscaler(_)));

            for mut manifest in manifests {
                let meta = manifest.metadata_mut();
                meta.namespace = Some(namespace.clone());
                meta.owner_references = Some(vec![owner.clone()]);
                let object_labels = meta.labels.get_or_insert_with(BTreeMap::new);
                object_labels.insert(labels::WORKLOAD.to_string(), name.clone());
                object_labels.insert(labels::POD_SET.to_string(), pod_set.name.clone());
                object_labels.insert(labels::MANAGED_BY.to_string(), labels::MANAGER.to_string());

                let options = ApplyOptions {
                    ignore_replicas: autoscaled && manifest.is_workload(),
                    max_attempts: self.settings.max_attempts,
                };
                ResourceReconciler::with_options(client, options)
                    .reconcile_dynamic(&manifest.api_resource(), &manifest.to_dynamic()?, DesiredState::Present)
                    .await?;

                owned.insert(ResourceId::new(manifest.kind(), manifest.name()));
                if manifest.is_workload() {
                    workloads.push(RenderedWorkload {
                        pod_set: pod_set.name.clone(),
                        kind: manifest.kind(),
                        name: manifest.name().to_string(),
                        replicas: manifest_replicas(&manifest),
                    });
                }
            }
        }
        Ok((owned, workloads))
    }

    async fn pod_set_status(
        &self,
        client: &dyn ClusterClient,
        namespace: &str,
        rendered: &RenderedWorkload,
    ) -> Result<PodSetStatusInfo> {
        let live = match rendered.kind {
            "StatefulSet" => store::get::<StatefulSet>(client, namespace, &rendered.name)
                .await?
                .map(|s| statefulset_status(&rendered.pod_set, &s)),
            _ => store::get::<Deployment>(client, namespace, &rendered.name)
                .await?
                .map(|d| deployment_status(&rendered.pod_set, &d)),
        };
        // Not visible yet: nothing is available
        Ok(live.unwrap_or_else(|| PodSetStatusInfo {
            name: rendered.pod_set.clone(),
            desired: rendered.replicas,
            unavailable: rendered.replicas,
            ..Default::default()
        }))
    }

    /// Recent Warning events on objects the workload owns, newest first
    async fn warnings(
        &self,
        client: &dyn ClusterClient,
        namespace: &str,
        owned: &HashSet<ResourceId>,
    ) -> Vec<WarningEvent> {
        let options = ListOptions::default().fields("type=Warning");
        let events = match store::list::<Event>(client, Some(namespace), &options).await {
            Ok(events) => events,
            Err(e) => {
                warn!(cluster = %client.cluster_name(), namespace = %namespace, error = %e, "Failed to list warning events");
                return Vec::new();
            }
        };
        let warnings = events
            .iter()
            .filter(|event| {
                event
                    .involved_object
                    .name
                    .as_deref()
                    .is_some_and(|n| owned.iter().any(|id| owns_object(&id.name, n)))
            })
            .map(|event| warning_event(client.cluster_name(), event))
            .collect();
        latest_warnings(warnings, self.settings.warning_limit)
    }

    async fn write_status(
        &self,
        client: &dyn ClusterClient,
        key: &ObjectKey,
        status: &WorkloadStatus,
    ) -> Result<()> {
        let (namespace, name) = (key.namespace.as_str(), key.name.as_str());
        let operation = format!("status {}", key);
        with_optimistic_retry(self.settings.max_attempts, &operation, || async move {
            let Some(mut latest) = store::get_latest::<ClusterScopedWorkload>(client, namespace, name).await?
            else {
                return Ok::<(), CoreError>(());
            };
            latest.status = Some(status.clone());
            store::update_status(client, &latest).await?;
            Ok(())
        })
        .await
    }

    /// Delete objects labelled for this workload that it no longer renders
    async fn collect_orphans(
        &self,
        client: &dyn ClusterClient,
        key: &ObjectKey,
        status: &WorkloadStatus,
        owned: &HashSet<ResourceId>,
    ) -> Result<usize> {
        if status.desired > status.available {
            return Ok(0);
        }
        let options = ListOptions::default().labels(format!("{}={}", labels::WORKLOAD, key.name));
        let kinds = collected_kinds();
        let mut found = Vec::new();
        for ar in &kinds {
            for object in client.list(ar, Some(key.namespace.as_str()), &options).await? {
                found.push(ResourceId::new(ar.kind.clone(), object.name_any()));
            }
        }

        let orphans = select_orphans(status.desired, status.available, &found, owned);
        let mut deleted = 0;
        for orphan in &orphans {
            let Some(ar) = kinds.iter().find(|ar| ar.kind == orphan.kind) else {
                continue;
            };
            if client.delete(ar, &key.namespace, &orphan.name).await? {
                info!(cluster = %client.cluster_name(), key = %key, object = %orphan, "Deleted orphan");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Reconcile for WorkloadReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cluster) = key.cluster.as_deref() else {
            return Err(CoreError::InvalidDesiredState(format!(
                "cluster workload key {} has no cluster",
                key
            )));
        };
        let handle = match self.registry.get(cluster).await {
            Ok(handle) => handle,
            Err(e) if e.is_cluster_unavailable() => {
                debug!(key = %key, error = %e, "Skipping workload on unavailable cluster");
                return Ok(Action::Done);
            }
            Err(e) => return Err(e),
        };
        let client = handle.client();

        let Some(workload) =
            store::get::<ClusterScopedWorkload>(client, &key.namespace, &key.name).await?
        else {
            debug!(key = %key, "Cluster workload gone");
            return Ok(Action::Done);
        };
        if workload.metadata.deletion_timestamp.is_some() {
            return Ok(Action::Done);
        }

        let (owned, rendered) = self.apply_manifests(client, &workload).await?;
        let mut pod_sets = Vec::with_capacity(rendered.len());
        for item in &rendered {
            pod_sets.push(self.pod_set_status(client, &key.namespace, item).await?);
        }
        let warnings = self.warnings(client, &key.namespace, &owned).await;
        let status = workload_status(pod_sets, warnings, workload.metadata.generation);

        if workload.status.as_ref() != Some(&status) {
            self.write_status(client, key, &status).await?;
            debug!(key = %key, status = %status.status, desired = status.desired, available = status.available, "Workload status updated");
        }

        let collected = self.collect_orphans(client, key, &status, &owned).await?;
        if collected > 0 {
            info!(key = %key, collected = collected, "Collected orphaned objects");
        }

        Ok(match status.status {
            AppStatus::Installing => Action::requeue(self.settings.installing_requeue),
            AppStatus::Running => Action::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn deployment(replicas: i32, status: Option<DeploymentStatus>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web-blue".to_string()),
                generation: Some(2),
                labels: Some([(labels::VERSION.to_string(), "v2".to_string())].into()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status,
        }
    }

    fn settled(replicas: i32, available: i32) -> DeploymentStatus {
        DeploymentStatus {
            observed_generation: Some(2),
            replicas: Some(replicas),
            ready_replicas: Some(available),
            available_replicas: Some(available),
            updated_replicas: Some(replicas),
            unavailable_replicas: Some(replicas - available),
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_status() {
        let ready = deployment_status("blue", &deployment(3, Some(settled(3, 3))));
        assert_eq!((ready.desired, ready.available, ready.unavailable), (3, 3, 0));
        assert_eq!(ready.version, "v2");

        let partial = deployment_status("blue", &deployment(3, Some(settled(3, 1))));
        assert_eq!(partial.unavailable, 2);

        let mut unobserved = settled(3, 3);
        unobserved.observed_generation = Some(1);
        let rolling = deployment_status("blue", &deployment(3, Some(unobserved)));
        assert_eq!(rolling.available, 3);
        assert!(rolling.unavailable > 0);

        let fresh = deployment_status("blue", &deployment(2, None));
        assert_eq!((fresh.available, fresh.unavailable), (0, 2));

        let scaled_to_zero = deployment_status("blue", &deployment(0, Some(settled(0, 0))));
        assert_eq!(scaled_to_zero.unavailable, 0);
    }

    #[test]
    fn test_event_ownership_respects_name_boundaries() {
        assert!(owns_object("web-blue", "web-blue"));
        assert!(owns_object("web-blue", "web-blue-0"));
        assert!(owns_object("web-blue", "web-blue-7d9f8"));
        assert!(owns_object("web-blue", "web-blue-7d9f8-x2kqz"));

        assert!(!owns_object("web-blue", "web-bluegreen"));
        assert!(!owns_object("web-blue", "web-blue-canary-7d9f8-x2kqz"));
        assert!(!owns_object("web-blue", "web"));
    }

    #[test]
    fn test_workload_status_sums_pod_sets() {
        let blue = deployment_status("blue", &deployment(2, Some(settled(2, 2))));
        let mut green = blue.clone();
        green.name = "green".to_string();
        green.version = "v3".to_string();

        let status = workload_status(vec![blue.clone(), green], Vec::new(), Some(4));
        assert_eq!((status.desired, status.available, status.unavailable), (4, 4, 0));
        assert_eq!(status.version, "v2/v3");
        assert_eq!(status.status, AppStatus::Running);
        assert_eq!(status.observed_generation, Some(4));

        let mut huge = blue.clone();
        huge.desired = i32::MAX;
        huge.available = i32::MAX;
        let status = workload_status(vec![huge, blue.clone()], Vec::new(), None);
        assert_eq!(status.desired, i32::MAX);

        let short = deployment_status("red", &deployment(2, Some(settled(2, 1))));
        let status = workload_status(vec![blue, short], Vec::new(), None);
        assert_eq!(status.status, AppStatus::Installing);
    }
}
