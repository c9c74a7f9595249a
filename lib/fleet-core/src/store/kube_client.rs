//! API-server backed cluster client with a watch-fed read cache

use super::{object_key, ClusterClient, ListOptions, ObjectChange};
use crate::selector::{FieldSelector, LabelSelector};
use crate::{CoreError, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use futures::StreamExt;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// ClusterClient talking to a Kubernetes API server
pub struct KubeClusterClient {
    name: String,
    client: Client,
    watched: Vec<ApiResource>,
    caches: RwLock<HashMap<String, Store<DynamicObject>>>,
    events: broadcast::Sender<ObjectChange>,
}

fn cache_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.kind)
}

impl KubeClusterClient {
    /// Create a client for `name`. Reads of the `watched` kinds are served
    /// from the watch-cache once [`ClusterClient::start_cache`] returns.
    pub fn new(name: impl Into<String>, client: Client, watched: Vec<ApiResource>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            name: name.into(),
            client,
            watched,
            caches: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        }
    }

    fn cache(&self, ar: &ApiResource) -> Option<Store<DynamicObject>> {
        self.caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&cache_key(ar))
            .cloned()
    }

    fn location(object: &DynamicObject) -> (String, String) {
        (
            object.metadata.namespace.clone().unwrap_or_default(),
            object.metadata.name.clone().unwrap_or_default(),
        )
    }

    async fn run_watch(
        cluster: String,
        api: Api<DynamicObject>,
        ar: ApiResource,
        mut writer: Writer<DynamicObject>,
        events: broadcast::Sender<ObjectChange>,
        stop: CancellationToken,
    ) {
        let reader = writer.as_reader();
        let mut stream = kube::runtime::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(cluster = %cluster, kind = %ar.kind, error = %e, "Watch error, will retry");
                    continue;
                }
                None => break,
            };

            let change = match &event {
                Event::Apply(obj) | Event::InitApply(obj) => {
                    let old = reader
                        .get(&ObjectRef::from_obj_with(obj, ar.clone()))
                        .map(|o| (*o).clone());
                    Some(ObjectChange {
                        cluster: cluster.clone(),
                        kind: ar.kind.clone(),
                        old,
                        new: obj.clone(),
                        deleted: false,
                    })
                }
                Event::Delete(obj) => Some(ObjectChange {
                    cluster: cluster.clone(),
                    kind: ar.kind.clone(),
                    old: None,
                    new: obj.clone(),
                    deleted: true,
                }),
                Event::Init | Event::InitDone => None,
            };
            writer.apply_watcher_event(&event);
            if let Some(change) = change {
                let _ = events.send(change);
            }
        }
        debug!(cluster = %cluster, kind = %ar.kind, "Watch stopped");
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    fn cluster_name(&self) -> &str {
        &self.name
    }

    async fn get(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        if let Some(store) = self.cache(ar) {
            let mut key = ObjectRef::new_with(name, ar.clone());
            if !namespace.is_empty() {
                key = key.within(namespace);
            }
            return Ok(store.get(&key).map(|o| (*o).clone()));
        }
        self.get_latest(ar, namespace, name).await
    }

    async fn get_latest(
        &self,
        ar: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.api(ar, namespace)
            .get_opt(name)
            .await
            .map_err(|e| CoreError::from_kube(e, &ar.kind, &object_key(namespace, name)))
    }

    async fn list(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> Result<Vec<DynamicObject>> {
        if let Some(store) = self.cache(ar) {
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
            let empty = BTreeMap::new();
            let mut items = Vec::new();
            for object in store.state() {
                if namespace.is_some_and(|ns| object.metadata.namespace.as_deref() != Some(ns)) {
                    continue;
                }
                if let Some(selector) = &labels {
                    if !selector.matches(object.metadata.labels.as_ref().unwrap_or(&empty)) {
                        continue;
                    }
                }
                if let Some(selector) = &fields {
                    if !selector.matches(&serde_json::to_value(object.as_ref())?) {
                        continue;
                    }
                }
                items.push((*object).clone());
                if options.limit.is_some_and(|l| items.len() >= l as usize) {
                    break;
                }
            }
            return Ok(items);
        }

        let mut params = ListParams::default();
        if let Some(labels) = &options.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &options.field_selector {
            params = params.fields(fields);
        }
        if let Some(limit) = options.limit {
            params = params.limit(limit);
        }
        let list = self
            .api(ar, namespace.unwrap_or_default())
            .list(&params)
            .await
            .map_err(|e| CoreError::from_kube(e, &ar.kind, namespace.unwrap_or("*")))?;
        Ok(list.items)
    }

    async fn create(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = Self::location(object);
        self.api(ar, &namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| CoreError::from_kube(e, &ar.kind, &object_key(&namespace, &name)))
    }

    async fn update(&self, ar: &ApiResource, object: &DynamicObject) -> Result<DynamicObject> {
        let (namespace, name) = Self::location(object);
        self.api(ar, &namespace)
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| CoreError::from_kube(e, &ar.kind, &object_key(&namespace, &name)))
    }

    async fn update_status(
        &self,
        ar: &ApiResource,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let (namespace, name) = Self::location(object);
        self.api(ar, &namespace)
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(object)?)
            .await
            .map_err(|e| CoreError::from_kube(e, &ar.kind, &object_key(&namespace, &name)))
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api(ar, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match CoreError::from_kube(e, &ar.kind, &object_key(namespace, name)) {
                CoreError::NotFound { .. } => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| CoreError::Transient(format!("cluster {}: {}", self.name, e)))
    }

    async fn start_cache(&self, stop: CancellationToken) -> Result<()> {
        let mut readers = Vec::with_capacity(self.watched.len());
        for ar in &self.watched {
            let writer = Writer::<DynamicObject>::new(ar.clone());
            readers.push((ar.clone(), writer.as_reader()));
            tokio::spawn(Self::run_watch(
                self.name.clone(),
                Api::all_with(self.client.clone(), ar),
                ar.clone(),
                writer,
                self.events.clone(),
                stop.child_token(),
            ));
        }

        try_join_all(readers.iter().map(|(_, reader)| reader.wait_until_ready()))
            .await
            .map_err(|e| CoreError::Internal(format!("cluster {} cache: {}", self.name, e)))?;

        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        for (ar, reader) in readers {
            caches.insert(cache_key(&ar), reader);
        }
        info!(cluster = %self.name, kinds = caches.len(), "Watch-cache synced");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectChange> {
        self.events.subscribe()
    }
}
