use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::desired_topology::{ChartRef, PodSet};
use super::status::WorkloadStatus;

/// ClusterScopedWorkload is the per-cluster child of a DesiredTopology.
/// It is written only by the controller and owns the manifests rendered
/// from its pod sets.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apps.fleet.dev",
    version = "v1alpha1",
    kind = "ClusterScopedWorkload",
    plural = "clusterscopedworkloads",
    shortname = "csw",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    status = "WorkloadStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desired"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.available"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScopedWorkloadSpec {
    /// Sum of the pod set replicas on this cluster
    pub replicas: i32,

    /// Labels selecting the pods of this application
    #[serde(default)]
    pub selector: BTreeMap<String, String>,

    #[serde(default)]
    pub chart: ChartRef,

    /// Pod sets placed on this cluster, replicas resolved to absolute counts
    #[serde(default)]
    pub pod_sets: Vec<PodSet>,

    /// Render inputs for each pod set
    #[serde(default)]
    pub topology: WorkloadTopology,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadTopology {
    #[serde(default)]
    pub pod_sets: Vec<RenderedPodSet>,
}

/// Chart override values for one pod set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPodSet {
    pub name: String,

    /// Override values as YAML
    pub values: String,
}

impl ClusterScopedWorkload {
    /// Whether the status reflects the latest spec generation
    pub fn generation_observed(&self) -> bool {
        match (self.metadata.generation, self.status.as_ref()) {
            (Some(generation), Some(status)) => status.observed_generation == Some(generation),
            (None, Some(_)) => true,
            _ => false,
        }
    }
}
