//! Core building blocks for the fleet controller
//!
//! - store: object-safe verb surface over one cluster (API server or in-memory)
//! - resource: create-or-update reconciliation with semantic diffing
//! - retry: optimistic-concurrency retry loop
//! - render / component: chart rendering and per-kind value generation
//! - predicate: event filters applied before enqueueing

pub mod component;
pub mod error;
pub mod metrics;
pub mod predicate;
pub mod render;
pub mod resource;
pub mod retry;
pub mod selector;
pub mod store;

pub use component::{Component, ComponentRegistry, OverrideInput};
pub use error::{CoreError, Result};
pub use metrics::Metrics;
pub use render::{BuiltinChart, ChartRenderer, TypedManifest};
pub use resource::{ApplyOptions, DesiredState, ResourceReconciler};
pub use retry::{with_optimistic_retry, DEFAULT_CONFLICT_ATTEMPTS};
pub use store::{ClusterClient, KubeClusterClient, ListOptions, MemoryClient, ObjectChange};
