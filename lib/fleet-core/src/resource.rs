//! Create-or-update reconciliation of a single object
//!
//! [`ResourceReconciler`] makes the live object on a cluster match a desired
//! one: create when absent, update when the semantic diff is non-empty,
//! delete when the desired state is absent. Updates run inside
//! [`with_optimistic_retry`] and carry server-assigned fields forward from the
//! live object so that the write does not fight the API server.

use crate::retry::{with_optimistic_retry, DEFAULT_CONFLICT_ATTEMPTS};
use crate::store::{api_resource, object_key, to_dynamic, ClusterClient, Object};
use crate::{CoreError, Result};
use fleet_api::labels::LAST_APPLIED;
use kube::api::{ApiResource, DynamicObject};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Whether the object should exist on the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesiredState {
    Present,
    Absent,
}

/// Behaviour switches for a reconcile call
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// Leave `spec.replicas` alone, e.g. when an autoscaler owns it
    pub ignore_replicas: bool,
    /// Attempt budget for conflicting updates
    pub max_attempts: u32,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            ignore_replicas: false,
            max_attempts: DEFAULT_CONFLICT_ATTEMPTS,
        }
    }
}

/// Ensures objects on one cluster match their desired form
pub struct ResourceReconciler<'a> {
    client: &'a dyn ClusterClient,
    options: ApplyOptions,
}

impl<'a> ResourceReconciler<'a> {
    pub fn new(client: &'a dyn ClusterClient) -> Self {
        Self::with_options(client, ApplyOptions::default())
    }

    pub fn with_options(client: &'a dyn ClusterClient, options: ApplyOptions) -> Self {
        Self { client, options }
    }

    /// Reconcile a typed object. Returns the number of objects changed (0 or 1).
    pub async fn reconcile<K: Object>(&self, desired: &K, state: DesiredState) -> Result<usize> {
        self.reconcile_dynamic(&api_resource::<K>(), &to_dynamic(desired)?, state)
            .await
    }

    /// Reconcile an untyped object of kind `ar`
    pub async fn reconcile_dynamic(
        &self,
        ar: &ApiResource,
        desired: &DynamicObject,
        state: DesiredState,
    ) -> Result<usize> {
        let namespace = desired.metadata.namespace.clone().unwrap_or_default();
        let name = desired.metadata.name.clone().ok_or_else(|| {
            CoreError::InvalidDesiredState(format!("{} without a name", ar.kind))
        })?;
        let key = object_key(&namespace, &name);
        let cluster = self.client.cluster_name();
        let live = self.client.get(ar, &namespace, &name).await?;

        match (state, live) {
            (DesiredState::Absent, None) => Ok(0),
            (DesiredState::Absent, Some(_)) => {
                let deleted = self.client.delete(ar, &namespace, &name).await?;
                if deleted {
                    info!(cluster = %cluster, kind = %ar.kind, key = %key, "Deleted");
                }
                Ok(usize::from(deleted))
            }
            (DesiredState::Present, None) => {
                let stamped = stamp_last_applied(desired)?;
                match self.client.create(ar, &stamped).await {
                    Ok(_) => {
                        info!(cluster = %cluster, kind = %ar.kind, key = %key, "Created");
                        Ok(1)
                    }
                    // The read was served from a lagging cache
                    Err(CoreError::AlreadyExists { .. }) => {
                        self.update(ar, &stamped, &namespace, &name).await
                    }
                    Err(e) => Err(e),
                }
            }
            (DesiredState::Present, Some(live)) => {
                let stamped = stamp_last_applied(desired)?;
                let diff = semantic_diff(
                    &serde_json::to_value(&stamped)?,
                    &serde_json::to_value(&live)?,
                    self.options.ignore_replicas,
                );
                if diff.is_empty() {
                    return Ok(0);
                }
                debug!(cluster = %cluster, kind = %ar.kind, key = %key, fields = ?diff, "Drift detected");
                self.update(ar, &stamped, &namespace, &name).await
            }
        }
    }

    async fn update(
        &self,
        ar: &ApiResource,
        stamped: &DynamicObject,
        namespace: &str,
        name: &str,
    ) -> Result<usize> {
        let client = self.client;
        let ignore_replicas = self.options.ignore_replicas;
        let key = object_key(namespace, name);
        let operation = format!("update {} {}", ar.kind, key);

        with_optimistic_retry(self.options.max_attempts, &operation, || async move {
            match client.get_latest(ar, namespace, name).await? {
                None => {
                    client.create(ar, stamped).await?;
                }
                Some(current) => {
                    let mut next = stamped.clone();
                    carry_forward(&current, &mut next, ignore_replicas);
                    client.update(ar, &next).await?;
                }
            }
            Ok::<(), CoreError>(())
        })
        .await?;

        info!(cluster = %client.cluster_name(), kind = %ar.kind, key = %key, "Updated");
        Ok(1)
    }
}

/// Copy of `desired` carrying the last-applied annotation
pub fn stamp_last_applied(desired: &DynamicObject) -> Result<DynamicObject> {
    let mut stamped = desired.clone();
    let applied = last_applied_content(desired)?;
    stamped
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(LAST_APPLIED.to_string(), applied);
    Ok(stamped)
}

// Deterministic serialization of what this reconciler owns in `desired`
fn last_applied_content(desired: &DynamicObject) -> Result<String> {
    let mut annotations = desired.metadata.annotations.clone().unwrap_or_default();
    annotations.remove(LAST_APPLIED);

    let mut metadata = Map::new();
    if let Some(name) = &desired.metadata.name {
        metadata.insert("name".to_string(), Value::String(name.clone()));
    }
    if let Some(namespace) = &desired.metadata.namespace {
        metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
    }
    if let Some(labels) = &desired.metadata.labels {
        metadata.insert("labels".to_string(), serde_json::to_value(labels)?);
    }
    if !annotations.is_empty() {
        metadata.insert("annotations".to_string(), serde_json::to_value(&annotations)?);
    }

    let mut content = Map::new();
    content.insert("metadata".to_string(), Value::Object(metadata));
    if let Value::Object(data) = &desired.data {
        for (k, v) in data {
            if k != "status" {
                content.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(serde_json::to_string(&Value::Object(content))?)
}

/// Paths where `desired` is not reflected in `live`.
///
/// Only fields present in `desired` are compared, so defaults filled in by
/// the API server do not count as drift. `status` and server-managed metadata
/// are ignored; `spec.replicas` is ignored when `ignore_replicas` is set.
pub fn semantic_diff(desired: &Value, live: &Value, ignore_replicas: bool) -> Vec<String> {
    let mut diffs = Vec::new();
    let Some(fields) = desired.as_object() else {
        return diffs;
    };
    let ignored: &[&str] = if ignore_replicas {
        &["spec.replicas"]
    } else {
        &[]
    };

    for (field, value) in fields {
        match field.as_str() {
            "status" | "apiVersion" | "kind" => {}
            "metadata" => {
                let live_meta = live.get("metadata");
                for owned in ["labels", "annotations", "ownerReferences", "finalizers"] {
                    if let Some(desired_value) = value.get(owned) {
                        compare(
                            desired_value,
                            live_meta.and_then(|m| m.get(owned)),
                            &format!("metadata.{}", owned),
                            ignored,
                            &mut diffs,
                        );
                    }
                }
            }
            _ => compare(value, live.get(field), field, ignored, &mut diffs),
        }
    }
    diffs
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.values().all(is_zero),
    }
}

fn compare(
    desired: &Value,
    live: Option<&Value>,
    path: &str,
    ignored: &[&str],
    diffs: &mut Vec<String>,
) {
    if ignored.contains(&path) || desired.is_null() {
        return;
    }
    let live = match live {
        Some(Value::Null) | None => {
            if !is_zero(desired) {
                diffs.push(path.to_string());
            }
            return;
        }
        Some(live) => live,
    };

    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            for (k, v) in d {
                compare(v, l.get(k), &format!("{}.{}", path, k), ignored, diffs);
            }
        }
        (Value::Array(d), Value::Array(l)) => {
            if d.len() != l.len() {
                diffs.push(path.to_string());
                return;
            }
            for (i, (dv, lv)) in d.iter().zip(l.iter()).enumerate() {
                compare(dv, Some(lv), &format!("{}[{}]", path, i), ignored, diffs);
            }
        }
        (Value::Number(d), Value::Number(l)) => {
            if d.as_f64() != l.as_f64() {
                diffs.push(path.to_string());
            }
        }
        (d, l) => {
            if d != l {
                diffs.push(path.to_string());
            }
        }
    }
}

/// Keys of `field` ("labels" / "annotations") recorded in the last-applied
/// annotation of `current`
fn previously_applied(current: &DynamicObject, field: &str) -> Vec<String> {
    current
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED))
        .and_then(|applied| serde_json::from_str::<Value>(applied).ok())
        .and_then(|applied| {
            applied
                .get("metadata")
                .and_then(|m| m.get(field))
                .and_then(Value::as_object)
                .map(|m| m.keys().cloned().collect())
        })
        .unwrap_or_default()
}

fn merge_foreign(
    current: Option<&BTreeMap<String, String>>,
    next: &mut Option<BTreeMap<String, String>>,
    owned: &[String],
) {
    let Some(current) = current else {
        return;
    };
    for (k, v) in current {
        let ours = owned.contains(k) || k == LAST_APPLIED;
        let present = next.as_ref().is_some_and(|n| n.contains_key(k));
        if !ours && !present {
            next.get_or_insert_with(BTreeMap::new).insert(k.clone(), v.clone());
        }
    }
}

/// Copy server-assigned and foreign fields from `current` into `next` before
/// an update: resourceVersion, labels/annotations this reconciler never
/// applied, finalizers and owner references when `next` has none, allocated
/// Service addresses, and the live replica count when it is externally managed.
pub fn carry_forward(current: &DynamicObject, next: &mut DynamicObject, ignore_replicas: bool) {
    next.metadata.resource_version = current.metadata.resource_version.clone();

    let owned_labels = previously_applied(current, "labels");
    merge_foreign(current.metadata.labels.as_ref(), &mut next.metadata.labels, &owned_labels);
    let owned_annotations = previously_applied(current, "annotations");
    merge_foreign(
        current.metadata.annotations.as_ref(),
        &mut next.metadata.annotations,
        &owned_annotations,
    );

    if next.metadata.finalizers.is_none() {
        next.metadata.finalizers = current.metadata.finalizers.clone();
    }
    if next.metadata.owner_references.is_none() {
        next.metadata.owner_references = current.metadata.owner_references.clone();
    }

    let kind = current.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    let mut preserved: Vec<&str> = Vec::new();
    if kind == "Service" {
        preserved.extend(["clusterIP", "clusterIPs", "ipFamilies", "ipFamilyPolicy", "healthCheckNodePort"]);
    }
    if ignore_replicas {
        preserved.push("replicas");
    }
    let Some(current_spec) = current.data.get("spec").and_then(Value::as_object) else {
        return;
    };
    if let Some(next_spec) = next.data.get_mut("spec").and_then(Value::as_object_mut) {
        for field in preserved {
            let keep = field == "replicas" || !next_spec.contains_key(field);
            if keep {
                if let Some(value) = current_spec.get(field) {
                    next_spec.insert(field.to_string(), value.clone());
                }
            }
        }
    }
}
