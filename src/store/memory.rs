//! In-process store with API-server write semantics
//!
//! Every write bumps `resourceVersion` and rejects stale versions, spec
//! changes bump `generation`, and deleting an object that still carries
//! finalizers only sets its deletion timestamp. The object disappears once its
//! last finalizer is removed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{ObjectCache, ObjectStore};
use crate::controller::error::{Error, Result};

type Key = (String, String);

pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<Key, Value>>,
    version: AtomicU64,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            _kind: std::marker::PhantomData,
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn key_of(value: &Value) -> Key {
    let meta = &value["metadata"];
    (
        meta["namespace"].as_str().unwrap_or_default().to_string(),
        meta["name"].as_str().unwrap_or_default().to_string(),
    )
}

fn display_key(key: &Key) -> String {
    if key.0.is_empty() {
        key.1.clone()
    } else {
        format!("{}/{}", key.0, key.1)
    }
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    !value["metadata"]["deletionTimestamp"].is_null()
}

fn check_version(stored: &Value, incoming: &Value, key: &Key) -> Result<()> {
    let incoming_rv = &incoming["metadata"]["resourceVersion"];
    if incoming_rv.is_null() || *incoming_rv == stored["metadata"]["resourceVersion"] {
        Ok(())
    } else {
        Err(Error::ConflictError(format!(
            "{}: resourceVersion {} is stale",
            display_key(key),
            incoming_rv
        )))
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle, ready to be used as a `Store<K>`
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Key, Value>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Key, Value>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn decode(value: &Value) -> Result<K> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Put an object as-is, filling in server-side metadata; no version checks
    pub fn insert(&self, obj: K) -> Result<K> {
        let mut value = serde_json::to_value(&obj)?;
        let meta = &mut value["metadata"];
        meta["resourceVersion"] = json!(self.next_version());
        if meta["generation"].is_null() {
            meta["generation"] = json!(1);
        }
        if meta["uid"].is_null() {
            meta["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        if meta["creationTimestamp"].is_null() {
            meta["creationTimestamp"] = json!(now());
        }
        let stored = Self::decode(&value)?;
        self.write().insert(key_of(&value), value);
        Ok(stored)
    }

    /// Current authoritative copy
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<K> {
        let objects = self.read();
        let value = objects.get(&(namespace.to_string(), name.to_string()))?;
        serde_json::from_value(value.clone()).ok()
    }

    /// All objects in a namespace, ordered by name
    pub fn list(&self, namespace: &str) -> Vec<K> {
        self.read()
            .iter()
            .filter(|((ns, _), _)| namespace.is_empty() || ns == namespace)
            .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Bump an object's resourceVersion as if another writer touched it
    pub fn touch(&self, namespace: &str, name: &str) {
        let rv = self.next_version();
        if let Some(value) = self
            .write()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            value["metadata"]["resourceVersion"] = json!(rv);
        }
    }
}

impl<K> ObjectCache<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn cached(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.snapshot(namespace, name).map(Arc::new)
    }

    fn cached_list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.list(namespace).into_iter().map(Arc::new).collect()
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.snapshot(namespace, name))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut value = serde_json::to_value(obj)?;
        let key = key_of(&value);
        if key.1.is_empty() {
            return Err(Error::MissingObjectKey(".metadata.name"));
        }

        let mut objects = self.write();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists(display_key(&key)));
        }
        let meta = &mut value["metadata"];
        meta["resourceVersion"] = json!(self.next_version());
        meta["generation"] = json!(1);
        meta["uid"] = json!(uuid::Uuid::new_v4().to_string());
        meta["creationTimestamp"] = json!(now());
        if let Some(meta) = meta.as_object_mut() {
            meta.remove("deletionTimestamp");
        }
        let created = Self::decode(&value)?;
        objects.insert(key, value);
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let mut value = serde_json::to_value(obj)?;
        let key = key_of(&value);

        let mut objects = self.write();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(display_key(&key)))?;
        check_version(stored, &value, &key)?;

        let stored_meta = &stored["metadata"];
        let generation = stored_meta["generation"].as_i64().unwrap_or(1);
        let generation = if value["spec"] != stored["spec"] {
            generation + 1
        } else {
            generation
        };

        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(obj) = value.as_object_mut() {
                    obj.remove("status");
                }
            }
        }

        let rv = self.next_version();
        let meta = &mut value["metadata"];
        meta["generation"] = json!(generation);
        meta["resourceVersion"] = json!(rv);
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            meta[field] = stored_meta[field].clone();
        }
        if let Some(meta) = meta.as_object_mut() {
            meta.retain(|_, v| !v.is_null());
        }

        let replaced = Self::decode(&value)?;
        if is_deleting(&value) && !has_finalizers(&value) {
            objects.remove(&key);
        } else {
            objects.insert(key, value);
        }
        Ok(replaced)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let incoming = serde_json::to_value(obj)?;
        let key = key_of(&incoming);

        let mut objects = self.write();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(display_key(&key)))?;
        check_version(stored, &incoming, &key)?;

        let mut value = stored.clone();
        match incoming.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(obj) = value.as_object_mut() {
                    obj.remove("status");
                }
            }
        }
        value["metadata"]["resourceVersion"] = json!(self.next_version());

        let updated = Self::decode(&value)?;
        objects.insert(key, value);
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut objects = self.write();
        let Some(value) = objects.get_mut(&key) else {
            return Ok(());
        };
        if !has_finalizers(value) {
            objects.remove(&key);
            return Ok(());
        }
        if !is_deleting(value) {
            value["metadata"]["deletionTimestamp"] = json!(now());
            value["metadata"]["resourceVersion"] = json!(self.next_version());
        }
        Ok(())
    }
}
