//! In-process cluster store
//!
//! Mirrors the API server behaviour the reconcilers depend on:
//! resourceVersion compare-and-swap on writes, generation bumps on spec
//! changes only, status writes through a separate verb, finalizers delaying
//! deletion and owner-reference cascading on removal.

use super::{object_key, ClusterClient, ListOptions, ObjectChange, Object};
use crate::selector::{FieldSelector, LabelSelector};
use crate::{CoreError, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ApiResource, DynamicObject, TypeMeta};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

type StoreKey = (String, String, String);

/// Cluster store kept entirely in memory
pub struct MemoryClient {
    name: String,
    state: Mutex<State>,
    events: broadcast::Sender<ObjectChange>,
}

struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    resource_version: u64,
    writes: usize,
    online: bool,
    pending_conflicts: usize,
    pending_failures: usize,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn check_available(&mut self, cluster: &str) -> Result<()> {
        if !self.online {
            return Err(CoreError::Transient(format!("cluster {} unreachable", cluster)));
        }
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(CoreError::Transient(format!(
                "cluster {}: injected failure",
                cluster
            )));
        }
        Ok(())
    }

    // Removes the object and everything it owns, transitively
    fn remove_cascading(&mut self, key: &StoreKey) -> Vec<DynamicObject> {
        let mut removed = Vec::new();
        let mut pending = vec![key.clone()];
        while let Some(key) = pending.pop() {
            let Some(object) = self.objects.remove(&key) else {
                continue;
            };
            if let Some(uid) = object.metadata.uid.as_deref() {
                pending.extend(
                    self.objects
                        .iter()
                        .filter(|(_, o)| {
                            o.metadata
                                .owner_references
                                .as_ref()
                                .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
                        })
                        .map(|(k, _)| k.clone()),
                );
            }
            removed.push(object);
        }
        removed
    }
}

fn kind_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

fn store_key(ar: &ApiResource, namespace: &str, name: &str) -> StoreKey {
    (kind_key(ar), namespace.to_string(), name.to_string())
}

fn type_meta(ar: &ApiResource) -> TypeMeta {
    TypeMeta {
        api_version: ar.api_version.clone(),
        kind: ar.kind.clone(),
    }
}

fn key_of(ar: &ApiResource, object: &DynamicObject) -> Result<StoreKey> {
    let name = object.metadata.name.as_deref().ok_or_else(|| {
        CoreError::InvalidDesiredState(format!("{} without a name", ar.kind))
    })?;
    Ok(store_key(
        ar,
        object.metadata.namespace.as_deref().unwrap_or_default(),
        name,
    ))
}

fn spec_content(object: &DynamicObject) -> Value {
    let mut data = object.data.clone();
    if let Value::Object(map) = &mut data {
        map.remove("status");
    }
    data
}

fn set_status(object: &mut DynamicObject, status: Option<Value>) {
    if !object.data.is_object() {
        object.data = Value::Object(Default::default());
    }
    if let Value::Object(map) = &mut object.data {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status);
            }
            None => {
                map.remove("status");
            }
        }
    }
}

impl MemoryClient {
    pub fn new(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            name: name.into(),
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                resource_version: 0,
                writes: 0,
                online: true,
                pending_conflicts: 0,
                pending_failures: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, kind: &str, old: Option<DynamicObject>, new: DynamicObject, deleted: bool) {
        // No subscribers is fine
        let _ = self.events.send(ObjectChange {
            cluster: self.name.clone(),
            kind: kind.to_string(),
            old,
            new,
            deleted,
        });
    }

    /// Store an object as-is, status included, without counting a write.
    /// Used to seed state that other actors (kubelet, controllers) produce.
    pub fn insert<K: Object>(&self, object: &K) -> Result<K> {
        let ar = super::api_resource::<K>();
        let mut dynamic = super::to_dynamic(object)?;
        let key = key_of(&ar, &dynamic)?;
        let old = {
            let mut state = self.lock();
            let old = state.objects.get(&key).cloned();
            dynamic.types = Some(type_meta(&ar));
            dynamic.metadata.resource_version = Some(state.next_resource_version());
            if dynamic.metadata.generation.is_none() {
                dynamic.metadata.generation = Some(1);
            }
            if dynamic.metadata.uid.is_none() {
                dynamic.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            }
            state.objects.insert(key, dynamic.clone());
            old
        };
        self.publish(&ar.kind, old, dynamic.clone(), false);
        super::from_dynamic(&dynamic)
    }

    /// Number of writes (create, update, status update, delete) accepted so far
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn reset_writes(&self) {
        self.lock().writes = 0;
    }

    /// Simulate the API server becoming unreachable (or reachable again)
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Fail the next `n` updates with a conflict, as if another writer won the race
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().pending_conflicts = n;
    }

    /// Fail the next `n` verbs with a transient error
    pub fn inject_failures(&self, n: usize) {
        self.lock().pending_failures = n;
    }
}

#[async_trait]
impl ClusterClient for MemoryClient {
    fn cluster_name(&self) -> &str {
        &self.name
    }

    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let mut state = self.lock();
        state.check_available(&self.name)?;
        Ok(state.objects.get(&store_key(ar, namespace, name)).cloned())
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<Vec<DynamicObject>> {
        let labels = options
            .label_selector
            .as_deref()
            .map(LabelSelector::parse)
            .transpose()?;
        let fields = options
            .field_selector
            .as_deref()
            .map(FieldSelector::parse)
            .transpose()?;
        let kind = kind_key(ar);

        let mut state = self.lock();
        state.check_available(&self.name)?;
        let mut items = Vec::new();
        for ((k, ns, _), object) in state.objects.iter() {
            if *k != kind || namespace.is_some_and(|n| n != ns) {
                continue;
            }
            if let Some(selector) = &labels {
                let empty = BTreeMap::new();
                if !selector.matches(object.metadata.labels.as_ref().unwrap_or(&empty)) {
                    continue;
                }
            }
            if let Some(selector) = &fields {
                if !selector.matches(&serde_json::to_value(object)?) {
                    continue;
                }
            }
            items.push(object.clone());
            if options.limit.is_some_and(|l| items.len() >= l as usize) {
                break;
            }
        }
        Ok(items)
    }

    async fn create(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = key_of(ar, object)?;
        let created = {
            let mut state = self.lock();
            state.check_available(&self.name)?;
            if state.objects.contains_key(&key) {
                return Err(CoreError::AlreadyExists {
                    kind: ar.kind.clone(),
                    key: object_key(&key.1, &key.2),
                });
            }
            let mut created = object.clone();
            created.types = Some(type_meta(ar));
            set_status(&mut created, None);
            created.metadata.resource_version = Some(state.next_resource_version());
            created.metadata.generation = Some(1);
            created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            created.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
            created.metadata.deletion_timestamp = None;
            state.objects.insert(key.clone(), created.clone());
            state.writes += 1;
            created
        };
        debug!(cluster = %self.name, kind = %ar.kind, key = %object_key(&key.1, &key.2), "Created");
        self.publish(&ar.kind, None, created.clone(), false);
        Ok(created)
    }

    async fn update(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let key = key_of(ar, object)?;
        let display = object_key(&key.1, &key.2);
        let (existing, next, removed) = {
            let mut state = self.lock();
            state.check_available(&self.name)?;
            let existing = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| CoreError::NotFound {
                    kind: ar.kind.clone(),
                    key: display.clone(),
                })?;

            if state.pending_conflicts > 0 {
                state.pending_conflicts -= 1;
                let rv = state.next_resource_version();
                if let Some(stored) = state.objects.get_mut(&key) {
                    stored.metadata.resource_version = Some(rv);
                }
                return Err(CoreError::Conflict {
                    kind: ar.kind.clone(),
                    key: display,
                    message: "object was modified concurrently".to_string(),
                });
            }
            if let Some(rv) = object.metadata.resource_version.as_ref() {
                if existing.metadata.resource_version.as_ref() != Some(rv) {
                    return Err(CoreError::Conflict {
                        kind: ar.kind.clone(),
                        key: display,
                        message: format!("stale resourceVersion {}", rv),
                    });
                }
            }

            let mut next = object.clone();
            next.types = Some(type_meta(ar));
            set_status(&mut next, existing.data.get("status").cloned());
            next.metadata.uid = existing.metadata.uid.clone();
            next.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
            next.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
            let generation = existing.metadata.generation.unwrap_or(1);
            next.metadata.generation = Some(if spec_content(&existing) != spec_content(&next) {
                generation + 1
            } else {
                generation
            });
            next.metadata.resource_version = Some(state.next_resource_version());
            state.writes += 1;

            let finalized = next.metadata.deletion_timestamp.is_some()
                && next.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
            let removed = if finalized {
                state.objects.insert(key.clone(), next.clone());
                state.remove_cascading(&key)
            } else {
                state.objects.insert(key.clone(), next.clone());
                Vec::new()
            };
            (existing, next, removed)
        };

        if removed.is_empty() {
            self.publish(&ar.kind, Some(existing), next.clone(), false);
        } else {
            debug!(cluster = %self.name, kind = %ar.kind, key = %object_key(&key.1, &key.2), "Finalized and removed");
            for object in removed {
                let kind = object.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
                self.publish(&kind, None, object, true);
            }
        }
        Ok(next)
    }

    async fn update_status(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let key = key_of(ar, object)?;
        let display = object_key(&key.1, &key.2);
        let (existing, next) = {
            let mut state = self.lock();
            state.check_available(&self.name)?;
            let existing = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| CoreError::NotFound {
                    kind: ar.kind.clone(),
                    key: display.clone(),
                })?;
            if state.pending_conflicts > 0 {
                state.pending_conflicts -= 1;
                let rv = state.next_resource_version();
                if let Some(stored) = state.objects.get_mut(&key) {
                    stored.metadata.resource_version = Some(rv);
                }
                return Err(CoreError::Conflict {
                    kind: ar.kind.clone(),
                    key: display,
                    message: "object was modified concurrently".to_string(),
                });
            }
            if let Some(rv) = object.metadata.resource_version.as_ref() {
                if existing.metadata.resource_version.as_ref() != Some(rv) {
                    return Err(CoreError::Conflict {
                        kind: ar.kind.clone(),
                        key: display,
                        message: format!("stale resourceVersion {}", rv),
                    });
                }
            }
            let mut next = existing.clone();
            set_status(&mut next, object.data.get("status").cloned());
            next.metadata.resource_version = Some(state.next_resource_version());
            state.objects.insert(key, next.clone());
            state.writes += 1;
            (existing, next)
        };
        self.publish(&ar.kind, Some(existing), next.clone(), false);
        Ok(next)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        let key = store_key(ar, namespace, name);
        let (marked, removed) = {
            let mut state = self.lock();
            state.check_available(&self.name)?;
            let Some(existing) = state.objects.get(&key).cloned() else {
                return Ok(false);
            };
            state.writes += 1;
            let has_finalizers = existing
                .metadata
                .finalizers
                .as_ref()
                .is_some_and(|f| !f.is_empty());
            if has_finalizers {
                let rv = state.next_resource_version();
                let mut marked = existing.clone();
                if marked.metadata.deletion_timestamp.is_none() {
                    marked.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                }
                marked.metadata.resource_version = Some(rv);
                state.objects.insert(key.clone(), marked.clone());
                (Some((existing, marked)), Vec::new())
            } else {
                (None, state.remove_cascading(&key))
            }
        };

        debug!(cluster = %self.name, kind = %ar.kind, key = %object_key(namespace, name), "Deleted");
        if let Some((old, marked)) = marked {
            self.publish(&ar.kind, Some(old), marked, false);
        }
        for object in removed {
            let kind = object.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
            self.publish(&kind, None, object, true);
        }
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        if self.lock().online {
            Ok(())
        } else {
            Err(CoreError::Transient(format!("cluster {} unreachable", self.name)))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        self.events.subscribe()
    }
}
