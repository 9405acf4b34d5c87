//! BackendGroup reconciler
//!
//! Expands a group into one BackendRecord per (load balancer, backend) pair,
//! for every referenced LoadBalancer that is Created and not being deleted,
//! and keeps the owned records equal to that expectation.

use std::collections::HashSet;

use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::controller::Context;
use crate::controller::backends::{
    AttachTarget, BackendSettings, RecordOwner, apply_diff, build_record, is_registered,
    select_nodes, select_pods,
};
use crate::controller::diff::BackendDiff;
use crate::controller::error::Result;
use crate::controller::load_balancer::is_load_balancer_usable;
use crate::controller::naming::OwnerKind;
use crate::controller::sync_result::SyncResult;
use crate::crd::{BackendDescriptor, BackendGroup, BackendGroupStatus, BackendRecord};
use crate::store::{is_deleting, update_status_with_retry};

/// Backends selected by a group, independent of load balancers
pub fn group_backends(ctx: &Context, group: &BackendGroup) -> Vec<BackendDescriptor> {
    let namespace = group.namespace().unwrap_or_default();
    let spec = &group.spec;

    if let Some(pods) = &spec.pods {
        return select_pods(
            ctx.pods.as_ref(),
            &namespace,
            pods.by_label.as_ref(),
            pods.by_name.as_deref(),
        )
        .into_iter()
        .map(|pod| BackendDescriptor::Pod {
            name: pod.name_any(),
            port: pods.port.clone(),
        })
        .collect();
    }

    if let Some(svc) = &spec.service {
        if ctx.services.cached(&namespace, &svc.name).is_none() {
            debug!(service = %svc.name, "Selected service does not exist yet");
            return Vec::new();
        }
        return select_nodes(ctx.nodes.as_ref(), &svc.node_selector)
            .into_iter()
            .map(|node| BackendDescriptor::Service {
                name: svc.name.clone(),
                node_name: node.name_any(),
                port: svc.port.clone(),
            })
            .collect();
    }

    spec.static_addrs
        .iter()
        .flatten()
        .map(|addr| BackendDescriptor::Static { addr: addr.clone() })
        .collect()
}

/// Records a group should own right now
pub fn expected_records(ctx: &Context, group: &BackendGroup) -> Vec<BackendRecord> {
    let namespace = group.namespace().unwrap_or_default();
    let owner = RecordOwner::of(OwnerKind::BackendGroup, group);
    let settings = BackendSettings {
        parameters: group.spec.parameters.clone(),
        ensure_policy: group.spec.ensure_policy.clone(),
    };
    let backends = group_backends(ctx, group);

    let mut expected = Vec::new();
    for lb_name in &group.spec.load_balancers {
        let Some(lb) = ctx.load_balancers.cached(&namespace, lb_name) else {
            debug!(lb = %lb_name, "Referenced LoadBalancer does not exist");
            continue;
        };
        if !is_load_balancer_usable(&lb) {
            continue;
        }
        let status = lb.status.clone().unwrap_or_default();
        let target = AttachTarget {
            lb_name: lb_name.clone(),
            lb_driver: lb.spec.lb_driver.clone(),
            lb_info: status.lb_info,
            lb_attributes: lb.spec.attributes.clone(),
        };
        expected.extend(
            backends
                .iter()
                .map(|backend| build_record(&owner, &target, backend.clone(), &settings)),
        );
    }
    expected
}

/// Reconcile one BackendGroup
#[instrument(skip(ctx))]
pub async fn reconcile_backend_group(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<SyncResult> {
    let Some(cached) = ctx.backend_groups.cached(namespace, name) else {
        return Ok(SyncResult::Finished);
    };
    let group = (*cached).clone();
    if is_deleting(&group) {
        // owned records are garbage collected through their owner references
        return Ok(SyncResult::Finished);
    }

    let owner = RecordOwner::of(OwnerKind::BackendGroup, &group);
    let expected = expected_records(ctx, &group);
    let existing = owner.owned_records(ctx);
    let diff = BackendDiff::compute(&expected, &existing, &HashSet::new());

    if !diff.is_empty() {
        info!(
            create = diff.create.len(),
            update = diff.update.len(),
            delete = diff.delete.len(),
            "Applying backend changes"
        );
        apply_diff(ctx, &diff).await?;
    }

    let status = group_status(&expected, &existing);
    if group.status.as_ref() != Some(&status) {
        update_status_with_retry(
            ctx.backend_groups.as_ref(),
            group,
            ctx.conflict_retries(),
            move |obj| {
                if obj.status.as_ref() == Some(&status) {
                    return false;
                }
                obj.status = Some(status.clone());
                true
            },
        )
        .await?;
    }

    Ok(SyncResult::Finished)
}

/// Counts of expected records and of those already registered
pub fn group_status(expected: &[BackendRecord], existing: &[BackendRecord]) -> BackendGroupStatus {
    let expected_names: HashSet<String> = expected.iter().map(|r| r.name_any()).collect();
    let registered = existing
        .iter()
        .filter(|r| expected_names.contains(&r.name_any()) && is_registered(r))
        .count();
    BackendGroupStatus {
        backends: expected.len() as i32,
        registered_backends: registered as i32,
    }
}
