//! Expected-backend computation shared by BackendGroup and Bind

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::debug;

use crate::controller::Context;
use crate::controller::conditions::{condition_types, is_condition_true};
use crate::controller::diff::BackendDiff;
use crate::controller::error::Result;
use crate::controller::naming::{OwnerKind, backend_record_name};
use crate::crd::{
    BackendDescriptor, BackendRecord, BackendRecordSpec, EnsurePolicy, FINALIZER_DEREGISTER,
    LABEL_BACKEND_GROUP, LABEL_BIND, LABEL_LB_NAME, SelectPodByLabel, StringMap,
};
use crate::store::{ObjectCache, is_deleting, update_with_retry};

/// Owner of a set of BackendRecords
#[derive(Clone, Debug)]
pub struct RecordOwner {
    pub kind: OwnerKind,
    pub namespace: String,
    pub name: String,
    pub reference: Option<OwnerReference>,
}

impl RecordOwner {
    pub fn of<K>(kind: OwnerKind, obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            kind,
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            reference: obj.controller_owner_ref(&()),
        }
    }

    /// Label linking a record to this owner
    pub fn label(&self) -> &'static str {
        match self.kind {
            OwnerKind::BackendGroup => LABEL_BACKEND_GROUP,
            OwnerKind::Bind => LABEL_BIND,
        }
    }

    /// Whether the record belongs to this owner
    pub fn owns(&self, record: &BackendRecord) -> bool {
        record.labels().get(self.label()) == Some(&self.name)
    }

    /// Records currently owned, from the cache
    pub fn owned_records(&self, ctx: &Context) -> Vec<BackendRecord> {
        ctx.backend_records
            .cached_list(&self.namespace)
            .into_iter()
            .filter(|r| self.owns(r))
            .map(|r| (*r).clone())
            .collect()
    }
}

/// Load balancer a set of backends is attached to
#[derive(Clone, Debug)]
pub struct AttachTarget {
    pub lb_name: String,
    pub lb_driver: String,
    pub lb_info: StringMap,
    pub lb_attributes: StringMap,
}

/// Backend-side settings copied into every record
#[derive(Clone, Debug, Default)]
pub struct BackendSettings {
    pub parameters: StringMap,
    pub ensure_policy: Option<EnsurePolicy>,
}

/// Build the record attaching `backend` to `target` on behalf of `owner`
pub fn build_record(
    owner: &RecordOwner,
    target: &AttachTarget,
    backend: BackendDescriptor,
    settings: &BackendSettings,
) -> BackendRecord {
    let name = backend_record_name(owner.kind, &owner.name, &target.lb_name, &backend);
    let labels = BTreeMap::from([
        (LABEL_LB_NAME.to_string(), target.lb_name.clone()),
        (owner.label().to_string(), owner.name.clone()),
    ]);

    BackendRecord {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(owner.namespace.clone()),
            labels: Some(labels),
            finalizers: Some(vec![FINALIZER_DEREGISTER.to_string()]),
            owner_references: owner.reference.clone().map(|r| vec![r]),
            ..Default::default()
        },
        spec: BackendRecordSpec {
            lb_name: target.lb_name.clone(),
            lb_driver: target.lb_driver.clone(),
            lb_info: target.lb_info.clone(),
            lb_attributes: target.lb_attributes.clone(),
            backend,
            parameters: settings.parameters.clone(),
            ensure_policy: settings.ensure_policy.clone(),
        },
        status: None,
    }
}

/// Pods that can receive traffic: scheduled with an IP and not terminating
pub fn is_pod_available(pod: &Pod) -> bool {
    !is_deleting(pod)
        && pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .is_some_and(|ip| !ip.is_empty())
}

fn labels_match(labels: &BTreeMap<String, String>, selector: &StringMap) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Available pods chosen by label (minus exceptions) or by name
pub fn select_pods(
    pods: &dyn ObjectCache<Pod>,
    namespace: &str,
    by_label: Option<&SelectPodByLabel>,
    by_name: Option<&[String]>,
) -> Vec<Arc<Pod>> {
    let mut selected: Vec<Arc<Pod>> = match (by_label, by_name) {
        (Some(sel), _) => pods
            .cached_list(namespace)
            .into_iter()
            .filter(|p| labels_match(p.labels(), &sel.selector))
            .filter(|p| !sel.except.contains(&p.name_any()))
            .collect(),
        (None, Some(names)) => names
            .iter()
            .filter_map(|name| pods.cached(namespace, name))
            .collect(),
        (None, None) => Vec::new(),
    };
    selected.retain(|p| is_pod_available(p));
    selected.sort_by_key(|p| p.name_any());
    selected
}

/// Ready nodes matching a node selector
pub fn select_nodes(nodes: &dyn ObjectCache<Node>, selector: &StringMap) -> Vec<Arc<Node>> {
    let mut selected: Vec<Arc<Node>> = nodes
        .cached_list("")
        .into_iter()
        .filter(|n| labels_match(n.labels(), selector))
        .filter(|n| !is_deleting(n.as_ref()))
        .collect();
    selected.sort_by_key(|n| n.name_any());
    selected
}

/// Whether a record has been registered by its driver
pub fn is_registered(record: &BackendRecord) -> bool {
    record
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, condition_types::REGISTERED))
}

/// Apply a diff to the record store
///
/// Creating a record that already exists and deleting one that is gone are
/// both treated as done. An update that conflicts is re-read and reapplied
/// with the expected mutable fields.
pub async fn apply_diff(ctx: &Context, diff: &BackendDiff) -> Result<()> {
    let store = ctx.backend_records.as_ref();

    for record in &diff.create {
        match store.create(record).await {
            Ok(_) => debug!(record = %record.name_any(), lb = %record.spec.lb_name, "Created BackendRecord"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e),
        }
    }

    for record in &diff.update {
        let updated = update_with_retry(store, record.clone(), ctx.conflict_retries(), |obj| {
            obj.spec.lb_attributes = record.spec.lb_attributes.clone();
            obj.spec.parameters = record.spec.parameters.clone();
            obj.spec.ensure_policy = record.spec.ensure_policy.clone();
            true
        })
        .await?;
        if updated.is_some() {
            debug!(record = %record.name_any(), "Updated BackendRecord");
        }
    }

    for record in &diff.delete {
        if is_deleting(record) {
            continue;
        }
        let namespace = record.namespace().unwrap_or_default();
        store.delete(&namespace, &record.name_any()).await?;
        debug!(record = %record.name_any(), "Deleted BackendRecord");
    }

    Ok(())
}
