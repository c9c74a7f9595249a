//! Replica resolution for pod sets
//!
//! Pod-set counts are absolute or percentages. A percentage pod set resolves
//! against the absolute template total, rounding up. A percentage template
//! total scales every absolute pod set. When the template total is an
//! absolute count, the resolved pod sets must add up to it exactly.

use fleet_api::{ClusterTarget, DesiredTopologySpec, PodSet, ReplicaCount};
use fleet_core::{CoreError, Result};
use std::collections::HashSet;

/// One pod set with its replica count resolved
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPodSet {
    pub pod_set: PodSet,
    pub replicas: i32,
}

/// A cluster target with every pod set resolved
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTarget {
    pub cluster: String,
    pub pod_sets: Vec<ResolvedPodSet>,
}

impl ResolvedTarget {
    /// Total replicas on this cluster. Resolution has already rejected
    /// totals that do not fit an i32.
    pub fn replicas(&self) -> i32 {
        self.pod_sets
            .iter()
            .fold(0i32, |sum, p| sum.saturating_add(p.replicas))
    }
}

fn invalid(message: String) -> CoreError {
    CoreError::InvalidDesiredState(message)
}

fn percent_of(total: i32, percent: u32, what: &str) -> Result<i32> {
    let scaled = (i64::from(total) * i64::from(percent) + 99) / 100;
    i32::try_from(scaled)
        .map_err(|_| invalid(format!("{}: {}% of {} does not fit a replica count", what, percent, total)))
}

/// Sum replica counts, rejecting totals that overflow
fn checked_sum(counts: impl IntoIterator<Item = i32>, what: &str) -> Result<i32> {
    counts.into_iter().try_fold(0i32, |sum, n| {
        sum.checked_add(n)
            .ok_or_else(|| invalid(format!("{}: replica counts overflow", what)))
    })
}

fn parse_percent(count: &ReplicaCount, what: &str) -> Result<u32> {
    count
        .percent()
        .ok_or_else(|| invalid(format!("{}: malformed replica count {:?}", what, count)))
}

/// Resolve one pod set against the template total
pub fn resolve_pod_set(pod_set: &PodSet, total: Option<&ReplicaCount>) -> Result<i32> {
    let what = format!("pod set {}", pod_set.name);
    let replicas = match (&pod_set.replicas, total) {
        (ReplicaCount::Absolute(n), None) | (ReplicaCount::Absolute(n), Some(ReplicaCount::Absolute(_))) => *n,
        (ReplicaCount::Absolute(n), Some(scale @ ReplicaCount::Percent(_))) => {
            percent_of(*n, parse_percent(scale, "template")?, &what)?
        }
        (count @ ReplicaCount::Percent(_), Some(ReplicaCount::Absolute(total))) => {
            let percent = parse_percent(count, &what)?;
            if percent > 100 {
                return Err(invalid(format!("{}: {}% exceeds the template total", what, percent)));
            }
            percent_of(*total, percent, &what)?
        }
        (ReplicaCount::Percent(_), _) => {
            return Err(invalid(format!(
                "{}: a percentage needs an absolute template replica count",
                what
            )))
        }
    };
    if replicas < 0 {
        return Err(invalid(format!("{}: negative replica count {}", what, replicas)));
    }
    Ok(replicas)
}

fn check_names(targets: &[ClusterTarget]) -> Result<()> {
    let mut clusters = HashSet::new();
    for target in targets {
        if target.cluster.is_empty() {
            return Err(invalid("target without a cluster name".to_string()));
        }
        if !clusters.insert(target.cluster.as_str()) {
            return Err(invalid(format!("cluster {} targeted twice", target.cluster)));
        }
        let mut pod_sets = HashSet::new();
        for pod_set in &target.pod_sets {
            if pod_set.name.is_empty() {
                return Err(invalid(format!("cluster {}: pod set without a name", target.cluster)));
            }
            if !pod_sets.insert(pod_set.name.as_str()) {
                return Err(invalid(format!(
                    "cluster {}: pod set {} declared twice",
                    target.cluster, pod_set.name
                )));
            }
        }
    }
    Ok(())
}

/// Resolve every target of a topology and check the replica sum
pub fn resolve_targets(spec: &DesiredTopologySpec) -> Result<Vec<ResolvedTarget>> {
    check_names(&spec.targets)?;
    let total = spec.template.replicas.as_ref();

    let mut resolved = Vec::with_capacity(spec.targets.len());
    for target in &spec.targets {
        let mut pod_sets = Vec::with_capacity(target.pod_sets.len());
        for pod_set in &target.pod_sets {
            pod_sets.push(ResolvedPodSet {
                pod_set: pod_set.clone(),
                replicas: resolve_pod_set(pod_set, total)?,
            });
        }
        checked_sum(
            pod_sets.iter().map(|p| p.replicas),
            &format!("cluster {}", target.cluster),
        )?;
        resolved.push(ResolvedTarget {
            cluster: target.cluster.clone(),
            pod_sets,
        });
    }

    if let Some(ReplicaCount::Absolute(expected)) = total {
        let sum = checked_sum(resolved.iter().map(ResolvedTarget::replicas), "topology")?;
        if sum != *expected {
            return Err(invalid(format!(
                "pod set replicas add up to {}, template asks for {}",
                sum, expected
            )));
        }
    }
    Ok(resolved)
}
