use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rollout state of a topology or of one of its cluster workloads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AppStatus {
    /// Every replica is available at the desired version
    Running,
    /// A rollout is in progress or the state has not been observed yet
    #[default]
    Installing,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Running => write!(f, "Running"),
            AppStatus::Installing => write!(f, "Installing"),
        }
    }
}

/// Status of a DesiredTopology, aggregated over every reachable cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStatus {
    #[serde(default)]
    pub desired: i32,

    #[serde(default)]
    pub available: i32,

    #[serde(default)]
    pub unavailable: i32,

    /// Distinct versions seen across all pod sets, sorted and slash-joined
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub status: AppStatus,

    /// Generation of the DesiredTopology this status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-cluster breakdown
    #[serde(default)]
    pub clusters: Vec<ClusterAppActual>,

    /// Most recent warning events across all clusters
    #[serde(default)]
    pub warnings: Vec<WarningEvent>,
}

/// Actual state of a topology on a single cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAppActual {
    pub name: String,

    #[serde(default)]
    pub desired: i32,

    #[serde(default)]
    pub available: i32,

    #[serde(default)]
    pub unavailable: i32,

    #[serde(default)]
    pub pod_sets: Vec<PodSetStatusInfo>,
}

/// Status of a ClusterScopedWorkload, computed from the live manifests it owns
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub desired: i32,

    #[serde(default)]
    pub available: i32,

    #[serde(default)]
    pub unavailable: i32,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub status: AppStatus,

    /// Generation of the ClusterScopedWorkload this status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub pod_sets: Vec<PodSetStatusInfo>,

    #[serde(default)]
    pub warnings: Vec<WarningEvent>,
}

/// Live status of one pod set, read from its Deployment or StatefulSet
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSetStatusInfo {
    pub name: String,

    #[serde(default)]
    pub desired: i32,

    #[serde(default)]
    pub available: i32,

    #[serde(default)]
    pub unavailable: i32,

    #[serde(default)]
    pub ready: i32,

    #[serde(default)]
    pub updated: i32,

    #[serde(default)]
    pub current: i32,

    #[serde(default)]
    pub version: String,
}

/// Warning event observed on an object owned by a workload
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarningEvent {
    /// Cluster the event was recorded in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// Kind/name of the involved object
    pub object: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub count: i32,

    /// RFC 3339 timestamp of the last occurrence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}
