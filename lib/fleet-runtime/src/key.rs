//! Work-queue keys

use fleet_api::labels;
use fleet_core::CoreError;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::str::FromStr;

/// Identifies one object to reconcile: `namespace/name`, or
/// `cluster/namespace/name` for objects living on a member cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub cluster: Option<String>,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: None,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn in_cluster(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: Some(cluster.into()),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object; the `fleet.dev/cluster` label puts it on a cluster
    pub fn for_object<K: Resource>(object: &K) -> Self {
        Self {
            cluster: object
                .labels()
                .get(labels::CLUSTER)
                .filter(|c| !c.is_empty())
                .cloned(),
            namespace: object.namespace().unwrap_or_default(),
            name: object.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.cluster, self.namespace.is_empty()) {
            (Some(cluster), _) => write!(f, "{}/{}/{}", cluster, self.namespace, self.name),
            (None, true) => write!(f, "{}", self.name),
            (None, false) => write!(f, "{}/{}", self.namespace, self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let key = match parts.as_slice() {
            [name] => Self::new("", *name),
            [namespace, name] => Self::new(*namespace, *name),
            [cluster, namespace, name] => Self::in_cluster(*cluster, *namespace, *name),
            _ => return Err(CoreError::InvalidDesiredState(format!("invalid key {:?}", s))),
        };
        if key.name.is_empty() || key.cluster.as_deref() == Some("") {
            return Err(CoreError::InvalidDesiredState(format!("invalid key {:?}", s)));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_display_and_parse() {
        for raw in ["web", "shop/web", "east/shop/web", "east//node-agent"] {
            let key: ObjectKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
        }
        let key: ObjectKey = "east/shop/web".parse().unwrap();
        assert_eq!(key.cluster.as_deref(), Some("east"));
        assert_eq!((key.namespace.as_str(), key.name.as_str()), ("shop", "web"));

        assert!("a/b/c/d".parse::<ObjectKey>().is_err());
        assert!("shop/".parse::<ObjectKey>().is_err());
        assert!("/shop/web".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn test_key_for_object() {
        let mut deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(ObjectKey::for_object(&deployment).to_string(), "shop/web");

        deployment.metadata.labels =
            Some([(labels::CLUSTER.to_string(), "east".to_string())].into());
        assert_eq!(ObjectKey::for_object(&deployment).to_string(), "east/shop/web");
    }
}
