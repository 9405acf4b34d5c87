//! Store backed by a reflector cache and the Kubernetes API

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store as ReflectorStore};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ObjectCache, ObjectStore};
use crate::controller::error::{Error, Result};

/// Read-only view over a reflector store
#[derive(Clone)]
pub struct ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader: ReflectorStore<K>,
}

impl<K> ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(reader: ReflectorStore<K>) -> Self {
        Self { reader }
    }
}

impl<K> ObjectCache<K> for ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn cached(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let key = if namespace.is_empty() {
            ObjectRef::new(name)
        } else {
            ObjectRef::new(name).within(namespace)
        };
        self.reader.get(&key)
    }

    fn cached_list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.reader
            .state()
            .into_iter()
            .filter(|obj| namespace.is_empty() || obj.namespace().as_deref() == Some(namespace))
            .collect()
    }
}

/// Reflector cache for reads, API server for versioned reads and writes
#[derive(Clone)]
pub struct KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    cache: ReflectorCache<K>,
    client: Client,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(client: Client, reader: ReflectorStore<K>) -> Self {
        Self {
            cache: ReflectorCache::new(reader),
            client,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + 'static,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: Resource>(obj: &K) -> Result<String> {
    obj.namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))
}

impl<K> ObjectCache<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn cached(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.cache.cached(namespace, name)
    }

    fn cached_list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.cache.cached_list(namespace)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        Ok(self
            .api(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        Ok(self
            .api(&namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        // PUT carries metadata.resourceVersion, so a stale writer gets a 409
        let data = serde_json::to_vec(obj)?;
        Ok(self
            .api(&namespace)
            .replace_status(&obj.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
