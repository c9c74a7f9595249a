//! Chart rendering
//!
//! A chart plus a YAML values document renders to a list of typed
//! manifests. [`ChartRenderer`] is the seam; [`BuiltinChart`] renders the
//! standard workload chart (a Deployment or StatefulSet, optionally a
//! Service and a HorizontalPodAutoscaler).

use crate::store::{api_resource, to_dynamic};
use crate::{CoreError, Result};
use fleet_api::labels;
use fleet_api::ChartRef;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// A rendered manifest
#[derive(Clone, Debug, PartialEq)]
pub enum TypedManifest {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    Service(Service),
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
}

impl TypedManifest {
    pub fn kind(&self) -> &'static str {
        match self {
            TypedManifest::Deployment(_) => "Deployment",
            TypedManifest::StatefulSet(_) => "StatefulSet",
            TypedManifest::Service(_) => "Service",
            TypedManifest::HorizontalPodAutoscaler(_) => "HorizontalPodAutoscaler",
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            TypedManifest::Deployment(o) => &o.metadata,
            TypedManifest::StatefulSet(o) => &o.metadata,
            TypedManifest::Service(o) => &o.metadata,
            TypedManifest::HorizontalPodAutoscaler(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            TypedManifest::Deployment(o) => &mut o.metadata,
            TypedManifest::StatefulSet(o) => &mut o.metadata,
            TypedManifest::Service(o) => &mut o.metadata,
            TypedManifest::HorizontalPodAutoscaler(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn api_resource(&self) -> ApiResource {
        match self {
            TypedManifest::Deployment(_) => api_resource::<Deployment>(),
            TypedManifest::StatefulSet(_) => api_resource::<StatefulSet>(),
            TypedManifest::Service(_) => api_resource::<Service>(),
            TypedManifest::HorizontalPodAutoscaler(_) => api_resource::<HorizontalPodAutoscaler>(),
        }
    }

    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        match self {
            TypedManifest::Deployment(o) => to_dynamic(o),
            TypedManifest::StatefulSet(o) => to_dynamic(o),
            TypedManifest::Service(o) => to_dynamic(o),
            TypedManifest::HorizontalPodAutoscaler(o) => to_dynamic(o),
        }
    }

    /// Whether this manifest runs pods (and reports pod-set status)
    pub fn is_workload(&self) -> bool {
        matches!(
            self,
            TypedManifest::Deployment(_) | TypedManifest::StatefulSet(_)
        )
    }
}

/// Renders a chart release into manifests
pub trait ChartRenderer: Send + Sync {
    fn render(
        &self,
        chart: &ChartRef,
        release: &str,
        namespace: &str,
        values: &str,
    ) -> Result<Vec<TypedManifest>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    StatefulSet,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceValues {
    pub port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalingValues {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization: Option<i32>,
}

/// Values understood by the standard workload chart
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChartValues {
    pub image: String,
    pub version: String,
    pub replicas: i32,
    pub workload_kind: WorkloadKind,
    pub selector: BTreeMap<String, String>,
    pub pod_labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<AutoscalingValues>,
}

impl ChartValues {
    pub fn from_yaml(values: &str) -> Result<Self> {
        if values.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(values).map_err(|e| CoreError::RenderError(format!("values: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn image_ref(&self) -> String {
        if self.version.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.version)
        }
    }
}

/// Renderer for the standard workload chart
#[derive(Clone, Debug, Default)]
pub struct BuiltinChart;

impl BuiltinChart {
    fn selector(values: &ChartValues, release: &str) -> BTreeMap<String, String> {
        if values.selector.is_empty() {
            [("app.kubernetes.io/instance".to_string(), release.to_string())].into()
        } else {
            values.selector.clone()
        }
    }
}

impl ChartRenderer for BuiltinChart {
    fn render(
        &self,
        chart: &ChartRef,
        release: &str,
        namespace: &str,
        values: &str,
    ) -> Result<Vec<TypedManifest>> {
        let values = ChartValues::from_yaml(values)?;
        if values.image.is_empty() {
            return Err(CoreError::RenderError(format!(
                "release {}: image must be set",
                release
            )));
        }
        if values.replicas < 0 {
            return Err(CoreError::RenderError(format!(
                "release {}: negative replicas {}",
                release, values.replicas
            )));
        }

        let selector = Self::selector(&values, release);
        let mut object_labels = selector.clone();
        object_labels.insert(labels::VERSION.to_string(), values.version.clone());
        object_labels.insert("helm.sh/chart".to_string(), format!("{}-{}", chart.name, chart.version));
        let mut pod_labels = selector.clone();
        pod_labels.extend(values.pod_labels.clone());
        pod_labels.insert(labels::VERSION.to_string(), values.version.clone());

        let container_port = values
            .service
            .as_ref()
            .map(|s| s.target_port.unwrap_or(s.port));
        let mut container = json!({"name": chart.name, "image": values.image_ref()});
        if let Some(port) = container_port {
            container["ports"] = json!([{"containerPort": port}]);
        }
        let template = json!({
            "metadata": {"labels": pod_labels},
            "spec": {"containers": [container]}
        });

        let mut manifests = Vec::new();
        let workload_kind = match values.workload_kind {
            WorkloadKind::Deployment => {
                let deployment: Deployment = serde_json::from_value(json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": release, "namespace": namespace, "labels": object_labels},
                    "spec": {
                        "replicas": values.replicas,
                        "selector": {"matchLabels": selector},
                        "template": template
                    }
                }))?;
                manifests.push(TypedManifest::Deployment(deployment));
                "Deployment"
            }
            WorkloadKind::StatefulSet => {
                let statefulset: StatefulSet = serde_json::from_value(json!({
                    "apiVersion": "apps/v1",
                    "kind": "StatefulSet",
                    "metadata": {"name": release, "namespace": namespace, "labels": object_labels},
                    "spec": {
                        "replicas": values.replicas,
                        "serviceName": release,
                        "selector": {"matchLabels": selector},
                        "template": template
                    }
                }))?;
                manifests.push(TypedManifest::StatefulSet(statefulset));
                "StatefulSet"
            }
        };

        if let Some(service) = &values.service {
            let rendered: Service = serde_json::from_value(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": release, "namespace": namespace, "labels": object_labels},
                "spec": {
                    "selector": selector,
                    "ports": [{
                        "name": "http",
                        "port": service.port,
                        "targetPort": service.target_port.unwrap_or(service.port)
                    }]
                }
            }))?;
            manifests.push(TypedManifest::Service(rendered));
        }

        if let Some(autoscaling) = &values.autoscaling {
            let min = autoscaling.min_replicas.unwrap_or(values.replicas).max(1);
            if autoscaling.max_replicas < min {
                return Err(CoreError::RenderError(format!(
                    "release {}: maxReplicas {} below minReplicas {}",
                    release, autoscaling.max_replicas, min
                )));
            }
            let hpa: HorizontalPodAutoscaler = serde_json::from_value(json!({
                "apiVersion": "autoscaling/v2",
                "kind": "HorizontalPodAutoscaler",
                "metadata": {"name": release, "namespace": namespace, "labels": object_labels},
                "spec": {
                    "scaleTargetRef": {"apiVersion": "apps/v1", "kind": workload_kind, "name": release},
                    "minReplicas": min,
                    "maxReplicas": autoscaling.max_replicas,
                    "metrics": [{
                        "type": "Resource",
                        "resource": {
                            "name": "cpu",
                            "target": {
                                "type": "Utilization",
                                "averageUtilization": autoscaling.target_cpu_utilization.unwrap_or(80)
                            }
                        }
                    }]
                }
            }))?;
            manifests.push(TypedManifest::HorizontalPodAutoscaler(hpa));
        }

        Ok(manifests)
    }
}
