use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::status::AggregatedStatus;

/// DesiredTopology declares how an application should be laid out across
/// member clusters. The controller fans it out into one ClusterScopedWorkload
/// per target cluster and aggregates their status back here.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apps.fleet.dev",
    version = "v1alpha1",
    kind = "DesiredTopology",
    plural = "desiredtopologies",
    shortname = "dtop",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    status = "AggregatedStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desired"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.available"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct DesiredTopologySpec {
    /// Pod template shared by every pod set
    pub template: PodTemplate,

    /// Chart used to render the per-cluster workloads
    #[serde(default)]
    pub chart: ChartRef,

    /// Clusters this topology is placed on
    #[serde(default)]
    pub targets: Vec<ClusterTarget>,
}

/// Container image, version and replica count common to all pod sets
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    /// Container image without tag
    pub image: String,

    /// Image tag / application version
    pub version: String,

    /// Total replicas across all clusters, absolute or percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<ReplicaCount>,

    /// Labels selecting the pods of this application
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

/// Reference to the chart a workload is rendered from
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    /// Chart name
    #[serde(default)]
    pub name: String,

    /// Chart version
    #[serde(default)]
    pub version: String,

    /// Application kind selecting the component handler ("deployment", "statefulset")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Placement of pod sets on one cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTarget {
    /// Name of the member cluster
    pub cluster: String,

    /// Pod sets running on this cluster
    #[serde(default)]
    pub pod_sets: Vec<PodSet>,
}

/// A named subset of pods (e.g. "blue", "green", "canary")
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    /// Pod set name, unique within a cluster target
    pub name: String,

    /// Replicas of this pod set, absolute or a percentage of the template total
    pub replicas: ReplicaCount,

    /// Version override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Free-form metadata such as zone or routing group
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Replica count written either as an integer or as a percentage string ("25%")
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ReplicaCount {
    Absolute(i32),
    Percent(String),
}

impl Default for ReplicaCount {
    fn default() -> Self {
        ReplicaCount::Absolute(0)
    }
}

impl ReplicaCount {
    /// Parse the percentage form, returning `None` for absolute counts or
    /// malformed strings
    pub fn percent(&self) -> Option<u32> {
        match self {
            ReplicaCount::Absolute(_) => None,
            ReplicaCount::Percent(s) => s.trim().strip_suffix('%')?.trim().parse().ok(),
        }
    }
}

impl PodSet {
    /// Version of this pod set, falling back to the template version
    pub fn resolved_version<'a>(&'a self, template: &'a PodTemplate) -> &'a str {
        self.version.as_deref().unwrap_or(&template.version)
    }

    /// Image of this pod set, falling back to the template image
    pub fn resolved_image<'a>(&'a self, template: &'a PodTemplate) -> &'a str {
        self.image.as_deref().unwrap_or(&template.image)
    }
}

impl DesiredTopologySpec {
    /// Target entry for a cluster
    pub fn target(&self, cluster: &str) -> Option<&ClusterTarget> {
        self.targets.iter().find(|t| t.cluster == cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_count_untagged() {
        let abs: ReplicaCount = serde_json::from_str("3").unwrap();
        assert_eq!(abs, ReplicaCount::Absolute(3));
        let pct: ReplicaCount = serde_json::from_str("\"25%\"").unwrap();
        assert_eq!(pct.percent(), Some(25));
        assert_eq!(ReplicaCount::Percent("abc".into()).percent(), None);
        assert_eq!(abs.percent(), None);
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
template:
  image: registry.local/shop
  version: v1
  replicas: 4
  selector:
    app: shop
targets:
  - cluster: east
    podSets:
      - name: blue
        replicas: 2
        meta:
          zone: a
  - cluster: west
    podSets:
      - name: green
        replicas: 2
        version: v2
"#;
        let spec: DesiredTopologySpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.targets.len(), 2);
        assert_eq!(spec.template.replicas, Some(ReplicaCount::Absolute(4)));
        let green = &spec.target("west").unwrap().pod_sets[0];
        assert_eq!(green.resolved_version(&spec.template), "v2");
        assert_eq!(green.resolved_image(&spec.template), "registry.local/shop");
        assert!(spec.target("north").is_none());
    }
}
