/// API version v1alpha1 for Fleet CRDs

pub mod cluster_workload;
pub mod desired_topology;
pub mod status;

pub use cluster_workload::{
    ClusterScopedWorkload, ClusterScopedWorkloadSpec, RenderedPodSet, WorkloadTopology,
};
pub use desired_topology::{
    ChartRef, ClusterTarget, DesiredTopology, DesiredTopologySpec, PodSet, PodTemplate,
    ReplicaCount,
};
pub use status::{
    AggregatedStatus, AppStatus, ClusterAppActual, PodSetStatusInfo, WarningEvent, WorkloadStatus,
};

/// API group for Fleet resources
pub const API_GROUP: &str = "apps.fleet.dev";
/// API version for Fleet resources
pub const API_VERSION: &str = "v1alpha1";
