//! Two-tier topology reconciliation
//!
//! [`TopologyReconciler`] fans a DesiredTopology out into one
//! ClusterScopedWorkload per target cluster and aggregates their status;
//! [`WorkloadReconciler`] materializes each workload on its cluster.

pub mod aggregate;
pub mod fanout;
pub mod gc;
pub mod replicas;
pub mod topology;
pub mod version;
pub mod workload;

pub use aggregate::{aggregate, ChildReport, MAX_WARNINGS};
pub use fanout::{build_children, ExpectedChild};
pub use gc::{select_orphans, ResourceId};
pub use replicas::{resolve_targets, ResolvedPodSet, ResolvedTarget};
pub use topology::{TopologyReconciler, TopologySettings};
pub use version::merge_versions;
pub use workload::{WorkloadReconciler, WorkloadSettings};
