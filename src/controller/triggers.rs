//! Mapping from watched objects to the keys that must be reconciled
//!
//! Every function reads the caches only, so a stale cache can at worst
//! enqueue a key that then reconciles to a no-op.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::ResourceExt;

use crate::controller::Context;
use crate::crd::{
    BackendDescriptor, BackendRecord, LABEL_BACKEND_GROUP, LABEL_BIND, LoadBalancer,
    LoadBalancerDriver, SelectPodByLabel,
};
use crate::queue::ObjectKey;

/// Keys to enqueue on each owner queue
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Triggered {
    pub load_balancers: BTreeSet<ObjectKey>,
    pub backend_groups: BTreeSet<ObjectKey>,
    pub binds: BTreeSet<ObjectKey>,
}

impl Triggered {
    pub fn is_empty(&self) -> bool {
        self.load_balancers.is_empty() && self.backend_groups.is_empty() && self.binds.is_empty()
    }
}

fn selects_pod(by_label: Option<&SelectPodByLabel>, by_name: Option<&[String]>, pod: &Pod) -> bool {
    let name = pod.name_any();
    match (by_label, by_name) {
        (Some(sel), _) => {
            let labels = pod.labels();
            sel.selector.iter().all(|(k, v)| labels.get(k) == Some(v)) && !sel.except.contains(&name)
        }
        (None, Some(names)) => names.contains(&name),
        (None, None) => false,
    }
}

fn owners_of(record: &BackendRecord, namespace: &str, triggered: &mut Triggered) {
    if let Some(group) = record.labels().get(LABEL_BACKEND_GROUP) {
        triggered
            .backend_groups
            .insert(ObjectKey::new(namespace, group.clone()));
    }
    if let Some(bind) = record.labels().get(LABEL_BIND) {
        triggered.binds.insert(ObjectKey::new(namespace, bind.clone()));
    }
}

/// Owners interested in a pod: those selecting it now, and those still
/// holding a record for it (the pod may have stopped matching)
pub fn pod_changed(ctx: &Context, pod: &Pod) -> Triggered {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let mut triggered = Triggered::default();

    for group in ctx.backend_groups.cached_list(&namespace) {
        let Some(pods) = &group.spec.pods else { continue };
        if selects_pod(pods.by_label.as_ref(), pods.by_name.as_deref(), pod) {
            triggered
                .backend_groups
                .insert(ObjectKey::new(&namespace, group.name_any()));
        }
    }

    for bind in ctx.binds.cached_list(&namespace) {
        let pods = &bind.spec.pods;
        if selects_pod(pods.by_label.as_ref(), pods.by_name.as_deref(), pod) {
            triggered
                .binds
                .insert(ObjectKey::new(&namespace, bind.name_any()));
        }
    }

    for record in ctx.backend_records.cached_list(&namespace) {
        if matches!(&record.spec.backend, BackendDescriptor::Pod { name: pod_name, .. } if *pod_name == name)
        {
            owners_of(&record, &namespace, &mut triggered);
        }
    }

    triggered
}

/// Groups attaching the service's node ports
pub fn service_changed(ctx: &Context, service: &Service) -> Triggered {
    let namespace = service.namespace().unwrap_or_default();
    let name = service.name_any();
    let mut triggered = Triggered::default();
    for group in ctx.backend_groups.cached_list(&namespace) {
        if group.spec.service.as_ref().is_some_and(|s| s.name == name) {
            triggered
                .backend_groups
                .insert(ObjectKey::new(&namespace, group.name_any()));
        }
    }
    triggered
}

/// Every group selecting services; node selectors are re-evaluated by the group
pub fn node_changed(ctx: &Context) -> Triggered {
    let mut triggered = Triggered::default();
    for group in ctx.backend_groups.cached_list("") {
        if group.spec.service.is_some() {
            triggered.backend_groups.insert(ObjectKey::new(
                group.namespace().unwrap_or_default(),
                group.name_any(),
            ));
        }
    }
    triggered
}

/// Groups referencing a LoadBalancer whose status or attributes changed
pub fn load_balancer_changed(ctx: &Context, lb: &LoadBalancer) -> Triggered {
    let namespace = lb.namespace().unwrap_or_default();
    let name = lb.name_any();
    let mut triggered = Triggered::default();
    for group in ctx.backend_groups.cached_list(&namespace) {
        if group.spec.load_balancers.contains(&name) {
            triggered
                .backend_groups
                .insert(ObjectKey::new(&namespace, group.name_any()));
        }
    }
    triggered
}

/// The owner of a record, so registration counts and deletions are observed
pub fn record_changed(record: &BackendRecord) -> Triggered {
    let mut triggered = Triggered::default();
    owners_of(record, &record.namespace().unwrap_or_default(), &mut triggered);
    triggered
}

/// LoadBalancers and Binds using a driver that (re)appeared
///
/// Drivers in the system namespace serve every namespace.
pub fn driver_changed(ctx: &Context, driver: &LoadBalancerDriver) -> Triggered {
    let driver_ns = driver.namespace().unwrap_or_default();
    let name = driver.name_any();
    let scope = if driver_ns == ctx.system_namespace {
        ""
    } else {
        driver_ns.as_str()
    };
    let mut triggered = Triggered::default();

    for lb in ctx.load_balancers.cached_list(scope) {
        if lb.spec.lb_driver == name {
            triggered.load_balancers.insert(ObjectKey::new(
                lb.namespace().unwrap_or_default(),
                lb.name_any(),
            ));
        }
    }
    for bind in ctx.binds.cached_list(scope) {
        if bind.spec.load_balancers.iter().any(|t| t.driver == name) {
            triggered.binds.insert(ObjectKey::new(
                bind.namespace().unwrap_or_default(),
                bind.name_any(),
            ));
        }
    }
    triggered
}
