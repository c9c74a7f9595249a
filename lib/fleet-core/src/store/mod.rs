//! Verb surface over a single cluster's API store
//!
//! Every cluster is reached through [`ClusterClient`], an object-safe trait
//! speaking [`DynamicObject`]s. [`KubeClusterClient`] talks to a real API
//! server (reads served from a watch-fed cache once synced) and
//! [`MemoryClient`] keeps everything in-process. The generic helpers in this
//! module convert to and from typed resources.

pub mod kube_client;
pub mod memory;

pub use kube_client::KubeClusterClient;
pub use memory::MemoryClient;

use crate::{CoreError, Result};
use async_trait::async_trait;
use kube::api::{ApiResource, DynamicObject};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Typed resources the helpers in this module can read and write
pub trait Object:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// Options for list requests
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub limit: Option<u32>,
}

impl ListOptions {
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A change observed on a cluster, as published to subscribers
#[derive(Clone, Debug)]
pub struct ObjectChange {
    /// Cluster the change happened on
    pub cluster: String,
    /// Kind of the changed object
    pub kind: String,
    /// Previous state, if the object was known before
    pub old: Option<DynamicObject>,
    /// New state (last known state for deletions)
    pub new: DynamicObject,
    pub deleted: bool,
}

/// Verbs against one cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Name of the cluster this client talks to
    fn cluster_name(&self) -> &str;

    /// Read an object, from the watch-cache when one is synced for its kind
    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Read an object bypassing any cache, used before compare-and-swap writes
    async fn get_latest(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.get(ar, namespace, name).await
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; rejected with a conflict when its resourceVersion is stale
    async fn update(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject>;

    /// Replace only the status subresource
    async fn update_status(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object, returning `false` if it did not exist
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<bool>;

    /// Lightweight liveness check against the API server
    async fn ping(&self) -> Result<()>;

    /// Start the watch-cache and return once the initial listing completed.
    /// Watch loops stop when `stop` is cancelled.
    async fn start_cache(&self, _stop: CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Subscribe to changes seen by the watch-cache
    fn subscribe(&self) -> broadcast::Receiver<ObjectChange>;
}

/// API resource description of a typed resource
pub fn api_resource<K: Object>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// `namespace/name` (or `name` for cluster-scoped objects)
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(object: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

fn ensure_named<K: Object>(object: &K) -> Result<()> {
    match object.meta().name {
        Some(_) => Ok(()),
        None => Err(CoreError::InvalidDesiredState(format!(
            "{} without a name",
            K::kind(&())
        ))),
    }
}

pub async fn get<K: Object>(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<Option<K>> {
    client
        .get(&api_resource::<K>(), namespace, name)
        .await?
        .map(|o| from_dynamic(&o))
        .transpose()
}

pub async fn get_latest<K: Object>(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<Option<K>> {
    client
        .get_latest(&api_resource::<K>(), namespace, name)
        .await?
        .map(|o| from_dynamic(&o))
        .transpose()
}

pub async fn list<K: Object>(
    client: &dyn ClusterClient,
    namespace: Option<&str>,
    options: &ListOptions,
) -> Result<Vec<K>> {
    client
        .list(&api_resource::<K>(), namespace, options)
        .await?
        .iter()
        .map(from_dynamic)
        .collect()
}

pub async fn create<K: Object>(client: &dyn ClusterClient, object: &K) -> Result<K> {
    ensure_named(object)?;
    let created = client
        .create(&api_resource::<K>(), &to_dynamic(object)?)
        .await?;
    from_dynamic(&created)
}

pub async fn update<K: Object>(client: &dyn ClusterClient, object: &K) -> Result<K> {
    ensure_named(object)?;
    let updated = client
        .update(&api_resource::<K>(), &to_dynamic(object)?)
        .await?;
    from_dynamic(&updated)
}

pub async fn update_status<K: Object>(client: &dyn ClusterClient, object: &K) -> Result<K> {
    ensure_named(object)?;
    let updated = client
        .update_status(&api_resource::<K>(), &to_dynamic(object)?)
        .await?;
    from_dynamic(&updated)
}

pub async fn delete<K: Object>(
    client: &dyn ClusterClient,
    namespace: &str,
    name: &str,
) -> Result<bool> {
    client.delete(&api_resource::<K>(), namespace, name).await
}
