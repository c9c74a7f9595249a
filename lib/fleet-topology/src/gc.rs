//! Orphan selection for per-cluster garbage collection

use std::collections::HashSet;
use std::fmt;

/// Kind and name of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Objects found under a workload's label that it no longer renders.
///
/// Nothing is collected while the workload is short of available replicas:
/// an old pod set keeps serving until its replacement is up.
pub fn select_orphans(
    desired: i32,
    available: i32,
    found: &[ResourceId],
    owned: &HashSet<ResourceId>,
) -> Vec<ResourceId> {
    if desired > available {
        return Vec::new();
    }
    let mut orphans: Vec<ResourceId> = found
        .iter()
        .filter(|id| !owned.contains(*id))
        .cloned()
        .collect();
    orphans.sort();
    orphans.dedup();
    orphans
}
