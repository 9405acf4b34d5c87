//! Access to LBCF objects and the cluster objects they select
//!
//! Reads come in two flavours: [`ObjectCache`] serves the local, eventually
//! consistent watch cache; [`ObjectStore`] adds strongly consistent,
//! resourceVersion-checked reads and writes. A stale write is rejected with a
//! conflict and the caller re-reads and reapplies its mutation.

mod kube_store;
mod memory;

pub use kube_store::{KubeStore, ReflectorCache};
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::error::{Error, Result};

/// Default bound for re-read-and-reapply loops
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// Read-only view over the watch cache
pub trait ObjectCache<K>: Send + Sync {
    /// Object by namespace and name; cluster-scoped objects use an empty namespace
    fn cached(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    /// All cached objects in a namespace
    fn cached_list(&self, namespace: &str) -> Vec<Arc<K>>;
}

/// Authoritative, versioned store
#[async_trait]
pub trait ObjectStore<K>: ObjectCache<K>
where
    K: Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec; status is left untouched
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace status only
    async fn replace_status(&self, obj: &K) -> Result<K>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Shared handle to a store
pub type Store<K> = Arc<dyn ObjectStore<K>>;

/// Shared handle to a read-only cache
pub type Cache<K> = Arc<dyn ObjectCache<K>>;

/// Which write a retry loop performs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteKind {
    Object,
    Status,
}

async fn write_with_retry<K, F>(
    store: &dyn ObjectStore<K>,
    start: K,
    attempts: u32,
    kind: WriteKind,
    mut mutate: F,
) -> Result<Option<K>>
where
    K: kube::Resource + Clone + Send + Sync + 'static,
    F: FnMut(&mut K) -> bool + Send,
{
    let namespace = start.namespace().unwrap_or_default();
    let name = start.name_any();
    let mut current = start;

    for attempt in 1..=attempts.max(1) {
        let mut updated = current.clone();
        if !mutate(&mut updated) {
            return Ok(Some(current));
        }

        let written = match kind {
            WriteKind::Object => store.replace(&updated).await,
            WriteKind::Status => store.replace_status(&updated).await,
        };

        match written {
            Ok(obj) => return Ok(Some(obj)),
            Err(e) if e.is_conflict() => {
                debug!(
                    namespace = %namespace,
                    name = %name,
                    attempt,
                    "Write conflict, re-reading object"
                );
                match store.get(&namespace, &name).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(None),
                }
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        }
    }

    Err(Error::ConflictError(format!(
        "{}/{}: gave up after {} conflicting writes",
        namespace, name, attempts
    )))
}

/// Apply `mutate` to the object's status and write it back, re-reading on conflict
///
/// `mutate` returns false when nothing changed, which skips the write. Returns
/// `Ok(None)` if the object disappeared.
pub async fn update_status_with_retry<K, F>(
    store: &dyn ObjectStore<K>,
    start: K,
    attempts: u32,
    mutate: F,
) -> Result<Option<K>>
where
    K: kube::Resource + Clone + Send + Sync + 'static,
    F: FnMut(&mut K) -> bool + Send,
{
    write_with_retry(store, start, attempts, WriteKind::Status, mutate).await
}

/// Apply `mutate` to metadata/spec and write it back, re-reading on conflict
pub async fn update_with_retry<K, F>(
    store: &dyn ObjectStore<K>,
    start: K,
    attempts: u32,
    mutate: F,
) -> Result<Option<K>>
where
    K: kube::Resource + Clone + Send + Sync + 'static,
    F: FnMut(&mut K) -> bool + Send,
{
    write_with_retry(store, start, attempts, WriteKind::Object, mutate).await
}

/// Whether an object carries a finalizer
pub fn has_finalizer<K: kube::Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add a finalizer; returns false when already present
pub fn add_finalizer<K: kube::Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove a finalizer; returns false when absent
pub fn remove_finalizer<K: kube::Resource>(obj: &mut K, finalizer: &str) -> bool {
    if !has_finalizer(obj, finalizer) {
        return false;
    }
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
    true
}

/// Whether the object has been marked for deletion
pub fn is_deleting<K: kube::Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
