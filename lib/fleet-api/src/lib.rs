//! Fleet API types and CRDs for multi-cluster workload orchestration
//!
//! This library defines the custom resources reconciled by the fleet controller:
//! - DesiredTopology: user-authored target state across all clusters
//! - ClusterScopedWorkload: per-cluster child materialized from a DesiredTopology

pub mod labels;
pub mod v1alpha1;

pub use v1alpha1::{
    AggregatedStatus, AppStatus, ChartRef, ClusterAppActual, ClusterScopedWorkload,
    ClusterScopedWorkloadSpec, ClusterTarget, DesiredTopology, DesiredTopologySpec, PodSet,
    PodSetStatusInfo, PodTemplate, RenderedPodSet, ReplicaCount, WarningEvent, WorkloadStatus,
    WorkloadTopology,
};
