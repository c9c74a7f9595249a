//! Multi-cluster connectivity for the fleet controller
//!
//! A [`ClusterHandle`] is one cached, health-tracked connection; the
//! [`ClusterRegistry`] keeps the ordered set of them and [`ClusterDiscovery`]
//! fills it from static config and kubeconfig Secrets.

pub mod discovery;
pub mod handle;
pub mod registry;

pub use discovery::{ClusterDiscovery, Connector, DiscoverySettings, KubeConnector, StaticCluster};
pub use handle::{ClusterHandle, ClusterStatus};
pub use registry::{ClusterRegistry, DEFAULT_HEALTH_INTERVAL, DEFAULT_PROBE_TIMEOUT};
