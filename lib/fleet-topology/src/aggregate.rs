//! Bottom-up status aggregation
//!
//! Every target cluster reports the status of its ClusterScopedWorkload.
//! Clusters that could not be read contribute nothing and leave the pass
//! unobserved, which keeps the topology Installing.

use crate::version::merge_versions;
use fleet_api::{AggregatedStatus, AppStatus, ClusterAppActual, ClusterScopedWorkload, WarningEvent};

/// Warnings kept on the aggregated status
pub const MAX_WARNINGS: usize = 10;

/// What one target cluster reported
#[derive(Clone, Debug)]
pub struct ChildReport {
    pub cluster: String,
    /// `None` when the cluster was unreachable or the child is missing
    pub workload: Option<ClusterScopedWorkload>,
}

impl ChildReport {
    pub fn observed(cluster: impl Into<String>, workload: ClusterScopedWorkload) -> Self {
        Self {
            cluster: cluster.into(),
            workload: Some(workload),
        }
    }

    pub fn missing(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            workload: None,
        }
    }
}

/// Newest first, bounded to `limit`
pub fn latest_warnings(mut warnings: Vec<WarningEvent>, limit: usize) -> Vec<WarningEvent> {
    warnings.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.object.cmp(&b.object)));
    warnings.truncate(limit);
    warnings
}

/// Aggregate child reports into the status of a topology at `generation`
pub fn aggregate(reports: &[ChildReport], generation: Option<i64>) -> AggregatedStatus {
    let mut status = AggregatedStatus {
        observed_generation: generation,
        ..Default::default()
    };
    let mut observed = true;
    let mut children_running = true;
    let mut versions = Vec::new();
    let mut warnings = Vec::new();

    for report in reports {
        let Some(workload) = &report.workload else {
            observed = false;
            continue;
        };
        if !workload.generation_observed() {
            observed = false;
        }

        let mut actual = ClusterAppActual {
            name: report.cluster.clone(),
            ..Default::default()
        };
        match &workload.status {
            Some(child) => {
                actual.desired = child.desired;
                actual.available = child.available;
                actual.unavailable = child.unavailable;
                actual.pod_sets = child.pod_sets.clone();
                children_running &= child.status == AppStatus::Running;
                versions.push(child.version.clone());
                versions.extend(child.pod_sets.iter().map(|p| p.version.clone()));
                warnings.extend(child.warnings.iter().cloned().map(|mut w| {
                    w.cluster.get_or_insert_with(|| report.cluster.clone());
                    w
                }));
            }
            None => {
                actual.desired = workload.spec.replicas;
                children_running = false;
            }
        }

        status.desired = status.desired.saturating_add(actual.desired);
        status.available = status.available.saturating_add(actual.available);
        status.unavailable = status.unavailable.saturating_add(actual.unavailable);
        status.clusters.push(actual);
    }

    status.version = merge_versions(versions.iter().map(String::as_str));
    status.warnings = latest_warnings(warnings, MAX_WARNINGS);
    status.status = if observed
        && children_running
        && status.available == status.desired
        && status.unavailable == 0
    {
        AppStatus::Running
    } else {
        AppStatus::Installing
    };
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::{ClusterScopedWorkloadSpec, PodSetStatusInfo, WorkloadStatus};

    fn child(desired: i32, available: i32, version: &str, running: bool) -> ClusterScopedWorkload {
        let mut workload = ClusterScopedWorkload::new(
            "shop",
            ClusterScopedWorkloadSpec {
                replicas: desired,
                ..Default::default()
            },
        );
        workload.metadata.generation = Some(1);
        workload.status = Some(WorkloadStatus {
            desired,
            available,
            unavailable: desired - available,
            version: version.to_string(),
            status: if running { AppStatus::Running } else { AppStatus::Installing },
            observed_generation: Some(1),
            pod_sets: vec![PodSetStatusInfo {
                name: "blue".to_string(),
                desired,
                available,
                version: version.to_string(),
                ..Default::default()
            }],
            warnings: Vec::new(),
        });
        workload
    }

    fn warning(object: &str, last_seen: &str) -> WarningEvent {
        WarningEvent {
            object: object.to_string(),
            reason: "BackOff".to_string(),
            last_seen: Some(last_seen.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_all_clusters_running() {
        let reports = vec![
            ChildReport::observed("a", child(2, 2, "v1", true)),
            ChildReport::observed("b", child(2, 2, "v2", true)),
        ];
        let status = aggregate(&reports, Some(3));
        assert_eq!((status.desired, status.available, status.unavailable), (4, 4, 0));
        assert_eq!(status.status, AppStatus::Running);
        assert_eq!(status.version, "v1/v2");
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.clusters.len(), 2);
        assert_eq!(status.clusters[1].name, "b");
    }

    #[test]
    fn test_huge_counts_saturate() {
        let reports = vec![
            ChildReport::observed("a", child(i32::MAX, i32::MAX, "v1", true)),
            ChildReport::observed("b", child(1, 1, "v1", true)),
        ];
        let status = aggregate(&reports, Some(1));
        assert_eq!((status.desired, status.available), (i32::MAX, i32::MAX));
    }

    #[test]
    fn test_missing_cluster_is_excluded() {
        let reports = vec![
            ChildReport::observed("a", child(2, 2, "v1", true)),
            ChildReport::missing("b"),
        ];
        let status = aggregate(&reports, Some(1));
        assert_eq!((status.desired, status.available), (2, 2));
        assert_eq!(status.status, AppStatus::Installing);
        assert_eq!(status.clusters.len(), 1);
    }

    #[test]
    fn test_running_requires_every_condition() {
        let partial = aggregate(&[ChildReport::observed("a", child(3, 2, "v1", false))], None);
        assert_eq!(partial.status, AppStatus::Installing);
        assert_eq!(partial.unavailable, 1);

        // Counts line up but the child still reports Installing
        let lagging = aggregate(&[ChildReport::observed("a", child(2, 2, "v1", false))], None);
        assert_eq!(lagging.status, AppStatus::Installing);

        let mut stale = child(2, 2, "v1", true);
        stale.metadata.generation = Some(2);
        assert_eq!(
            aggregate(&[ChildReport::observed("a", stale)], None).status,
            AppStatus::Installing
        );

        let mut fresh = child(2, 0, "", true);
        fresh.status = None;
        let unreported = aggregate(&[ChildReport::observed("a", fresh)], None);
        assert_eq!((unreported.desired, unreported.available), (2, 0));
        assert_eq!(unreported.status, AppStatus::Installing);
    }

    #[test]
    fn test_warnings_newest_first_and_bounded() {
        let mut a = child(1, 1, "v1", true);
        a.status.as_mut().unwrap().warnings = (0..8)
            .map(|i| warning(&format!("Pod/a-{}", i), &format!("2026-01-01T00:00:0{}Z", i)))
            .collect();
        let mut b = child(1, 1, "v1", true);
        b.status.as_mut().unwrap().warnings = (0..5)
            .map(|i| warning(&format!("Pod/b-{}", i), &format!("2026-01-02T00:00:0{}Z", i)))
            .collect();

        let status = aggregate(
            &[ChildReport::observed("a", a), ChildReport::observed("b", b)],
            None,
        );
        assert_eq!(status.warnings.len(), MAX_WARNINGS);
        assert_eq!(status.warnings[0].object, "Pod/b-4");
        assert_eq!(status.warnings[0].cluster.as_deref(), Some("b"));
        assert_eq!(status.warnings[9].object, "Pod/a-3");
    }
}
