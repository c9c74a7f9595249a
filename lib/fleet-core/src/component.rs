//! Component handlers
//!
//! A component handler turns one pod set of a topology into the chart
//! values for its release. Handlers are registered by chart kind; charts
//! with an unknown or missing kind fall back to the default handler.

use crate::render::{AutoscalingValues, ChartValues, ServiceValues, WorkloadKind};
use crate::{CoreError, Result};
use fleet_api::labels;
use fleet_api::{ChartRef, PodSet, PodTemplate};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Everything a handler needs to produce a pod set's values
#[derive(Clone, Copy, Debug)]
pub struct OverrideInput<'a> {
    pub chart: &'a ChartRef,
    pub template: &'a PodTemplate,
    pub pod_set: &'a PodSet,
    /// Replica count already resolved for this pod set
    pub replicas: i32,
}

pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Values YAML for the pod set's release
    fn overrides(&self, input: &OverrideInput<'_>) -> Result<String>;
}

fn parse_meta<T: std::str::FromStr>(pod_set: &PodSet, key: &str) -> Result<Option<T>> {
    pod_set
        .meta
        .get(key)
        .map(|raw| {
            raw.parse().map_err(|_| {
                CoreError::InvalidDesiredState(format!(
                    "pod set {}: invalid {} {:?}",
                    pod_set.name, key, raw
                ))
            })
        })
        .transpose()
}

// Meta keys interpreted by the handlers; everything else becomes a pod label
const META_PORT: &str = "port";
const META_TARGET_PORT: &str = "targetPort";
const META_MAX_REPLICAS: &str = "maxReplicas";
const META_TARGET_CPU: &str = "targetCPU";

fn values_for(input: &OverrideInput<'_>, kind: WorkloadKind) -> Result<ChartValues> {
    let pod_set = input.pod_set;
    let mut selector: BTreeMap<String, String> = input.template.selector.clone();
    selector.insert(labels::POD_SET.to_string(), pod_set.name.clone());

    let reserved = [META_PORT, META_TARGET_PORT, META_MAX_REPLICAS, META_TARGET_CPU];
    let pod_labels = pod_set
        .meta
        .iter()
        .filter(|(k, _)| !reserved.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let service = parse_meta::<i32>(pod_set, META_PORT)?.map(|port| ServiceValues {
        port,
        target_port: None,
    });
    let service = match (service, parse_meta::<i32>(pod_set, META_TARGET_PORT)?) {
        (Some(mut service), target) => {
            service.target_port = target;
            Some(service)
        }
        (None, _) => None,
    };

    let autoscaling = parse_meta::<i32>(pod_set, META_MAX_REPLICAS)?
        .map(|max_replicas| -> Result<AutoscalingValues> {
            Ok(AutoscalingValues {
                min_replicas: Some(input.replicas.max(1)),
                max_replicas,
                target_cpu_utilization: parse_meta(pod_set, META_TARGET_CPU)?,
            })
        })
        .transpose()?;

    Ok(ChartValues {
        image: pod_set.resolved_image(input.template).to_string(),
        version: pod_set.resolved_version(input.template).to_string(),
        replicas: input.replicas,
        workload_kind: kind,
        selector,
        pod_labels,
        service,
        autoscaling,
    })
}

/// Stateless pods behind a Deployment
#[derive(Debug, Default)]
pub struct DeploymentComponent;

impl Component for DeploymentComponent {
    fn name(&self) -> &str {
        "deployment"
    }

    fn overrides(&self, input: &OverrideInput<'_>) -> Result<String> {
        values_for(input, WorkloadKind::Deployment)?.to_yaml()
    }
}

/// Pods with stable identity behind a StatefulSet
#[derive(Debug, Default)]
pub struct StatefulSetComponent;

impl Component for StatefulSetComponent {
    fn name(&self) -> &str {
        "statefulset"
    }

    fn overrides(&self, input: &OverrideInput<'_>) -> Result<String> {
        let values = values_for(input, WorkloadKind::StatefulSet)?;
        if values.autoscaling.is_some() {
            return Err(CoreError::InvalidDesiredState(format!(
                "pod set {}: autoscaling is not supported for statefulsets",
                input.pod_set.name
            )));
        }
        values.to_yaml()
    }
}

/// Name-keyed handlers with a default fallback
#[derive(Clone)]
pub struct ComponentRegistry {
    handlers: HashMap<String, Arc<dyn Component>>,
    default: Arc<dyn Component>,
}

impl ComponentRegistry {
    pub fn new(default: Arc<dyn Component>) -> Self {
        let mut handlers = HashMap::new();
        handlers.insert(default.name().to_string(), default.clone());
        Self { handlers, default }
    }

    pub fn register(&mut self, handler: Arc<dyn Component>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Handler for a chart kind, or the default one
    pub fn resolve(&self, kind: Option<&str>) -> Arc<dyn Component> {
        match kind.and_then(|k| self.handlers.get(&k.to_lowercase())) {
            Some(handler) => handler.clone(),
            None => {
                if let Some(kind) = kind {
                    debug!(kind = %kind, fallback = %self.default.name(), "No component handler registered, using default");
                }
                self.default.clone()
            }
        }
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        let mut registry = Self::new(Arc::new(DeploymentComponent));
        registry.register(Arc::new(StatefulSetComponent));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_api::ReplicaCount;

    fn template() -> PodTemplate {
        PodTemplate {
            image: "registry.local/web".to_string(),
            version: "v1".to_string(),
            replicas: Some(ReplicaCount::Absolute(4)),
            selector: [("app".to_string(), "web".to_string())].into(),
        }
    }

    fn pod_set(meta: &[(&str, &str)]) -> PodSet {
        PodSet {
            name: "blue".to_string(),
            replicas: ReplicaCount::Absolute(2),
            version: Some("v2".to_string()),
            image: None,
            meta: meta.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn chart(kind: Option<&str>) -> ChartRef {
        ChartRef {
            name: "web".to_string(),
            version: "1.0.0".to_string(),
            kind: kind.map(str::to_string),
        }
    }

    #[test]
    fn test_deployment_overrides() {
        let registry = ComponentRegistry::default();
        let chart = chart(None);
        let template = template();
        let pod_set = pod_set(&[("port", "80"), ("maxReplicas", "5"), ("track", "stable")]);
        let input = OverrideInput {
            chart: &chart,
            template: &template,
            pod_set: &pod_set,
            replicas: 2,
        };

        let yaml = registry.resolve(None).overrides(&input).unwrap();
        let values = ChartValues::from_yaml(&yaml).unwrap();
        assert_eq!(values.workload_kind, WorkloadKind::Deployment);
        assert_eq!(values.version, "v2");
        assert_eq!(values.image, "registry.local/web");
        assert_eq!(values.replicas, 2);
        assert_eq!(values.selector.get(labels::POD_SET).map(String::as_str), Some("blue"));
        assert_eq!(values.pod_labels.get("track").map(String::as_str), Some("stable"));
        assert!(!values.pod_labels.contains_key("port"));
        assert_eq!(values.service.unwrap().port, 80);
        assert_eq!(values.autoscaling.unwrap().max_replicas, 5);
    }

    #[test]
    fn test_registry_resolution_and_fallback() {
        let registry = ComponentRegistry::default();
        assert_eq!(registry.resolve(Some("StatefulSet")).name(), "statefulset");
        assert_eq!(registry.resolve(Some("cronjob")).name(), "deployment");
        assert_eq!(registry.resolve(None).name(), "deployment");
    }

    #[test]
    fn test_invalid_meta_is_permanent() {
        let chart = chart(Some("statefulset"));
        let template = template();
        let bad_port = pod_set(&[("port", "http")]);
        let input = OverrideInput {
            chart: &chart,
            template: &template,
            pod_set: &bad_port,
            replicas: 1,
        };
        assert!(DeploymentComponent.overrides(&input).unwrap_err().is_permanent());

        let scaled = pod_set(&[("maxReplicas", "3")]);
        let input = OverrideInput {
            pod_set: &scaled,
            ..input
        };
        assert!(StatefulSetComponent.overrides(&input).unwrap_err().is_permanent());
    }
}
