//! Well-known labels, annotations and finalizers

/// Cluster a child object belongs to. Work-queue keys of labelled objects are
/// prefixed with this value.
pub const CLUSTER: &str = "fleet.dev/cluster";

/// Name of the DesiredTopology that produced a ClusterScopedWorkload
pub const TOPOLOGY: &str = "fleet.dev/topology";

/// Name of the ClusterScopedWorkload that rendered a manifest
pub const WORKLOAD: &str = "fleet.dev/workload";

/// Pod set a rendered manifest belongs to
pub const POD_SET: &str = "fleet.dev/pod-set";

/// Resolved version of the pods of a pod set
pub const VERSION: &str = "fleet.dev/version";

/// Marks Secrets that carry a member cluster kubeconfig
pub const CLUSTER_CONFIG: &str = "fleet.dev/cluster-config";

/// Identifies the controller that manages an object
pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY`] for objects written by this controller
pub const MANAGER: &str = "fleet-controller";

/// Last desired state written by the resource reconciler
pub const LAST_APPLIED: &str = "fleet.dev/last-applied";

/// Blocks DesiredTopology deletion until every child is gone
pub const TOPOLOGY_FINALIZER: &str = "fleet.dev/topology-cleanup";
