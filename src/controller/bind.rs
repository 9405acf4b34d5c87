//! Bind reconciler
//!
//! A Bind owns several load balancers at once. Their lifecycle steps are
//! dispatched concurrently and joined before one status merge; backends are
//! then attached to every Created target. A target that leaves the spec, or
//! every target of a Bind being deleted, is deleted only after its backends
//! are gone.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::controller::Context;
use crate::controller::backends::{
    AttachTarget, BackendSettings, RecordOwner, apply_diff, build_record, select_pods,
};
use crate::controller::conditions::{condition_types, is_condition_true};
use crate::controller::diff::BackendDiff;
use crate::controller::error::Result;
use crate::controller::load_balancer::{
    BACKEND_CLEANUP_RECHECK, LoadBalancerTarget, TargetOutcome, sync_target,
};
use crate::controller::naming::OwnerKind;
use crate::controller::sync_result::SyncResult;
use crate::crd::{
    BackendDescriptor, BackendRecord, Bind, BindStatus, FINALIZER_DELETE_LB, LABEL_LB_NAME,
    StringMap, TargetLoadBalancerStatus,
};
use crate::driver::DriverRef;
use crate::store::{
    add_finalizer, has_finalizer, is_deleting, remove_finalizer, update_status_with_retry,
    update_with_retry,
};

/// Status entries the Bind should carry before this pass talks to any driver
///
/// Targets in the spec keep or get an entry; entries whose target left the
/// spec, or all entries of a deleting Bind, are flagged `deleting`.
pub fn plan_targets(bind: &Bind) -> Vec<TargetLoadBalancerStatus> {
    let bind_deleting = is_deleting(bind);
    let current = bind.status.clone().unwrap_or_default();
    let mut planned: Vec<TargetLoadBalancerStatus> = Vec::new();

    for target in &bind.spec.load_balancers {
        let mut entry = current
            .target(&target.name)
            .cloned()
            .unwrap_or_else(|| TargetLoadBalancerStatus {
                name: target.name.clone(),
                driver: target.driver.clone(),
                spec: target.spec.clone(),
                ..Default::default()
            });
        // a target put back with its old spec cancels the pending delete;
        // a new spec waits for the old load balancer to go first
        entry.deleting = bind_deleting || (entry.deleting && entry.spec != target.spec);
        planned.push(entry);
    }

    let in_spec: HashSet<&str> = bind
        .spec
        .load_balancers
        .iter()
        .map(|t| t.name.as_str())
        .collect();
    for entry in &current.load_balancer_statuses {
        if !in_spec.contains(entry.name.as_str()) {
            let mut entry = entry.clone();
            entry.deleting = true;
            planned.push(entry);
        }
    }
    planned
}

/// Merge per-target outcomes into the planned list, keyed by name
///
/// Entries without an outcome are carried over unchanged; entries whose load
/// balancer was deleted are dropped.
pub fn merge_statuses(
    planned: Vec<TargetLoadBalancerStatus>,
    outcomes: &HashMap<String, TargetOutcome>,
) -> BindStatus {
    let load_balancer_statuses = planned
        .into_iter()
        .filter_map(|mut entry| match outcomes.get(&entry.name) {
            Some(outcome) if outcome.deleted => None,
            Some(outcome) => {
                entry.state = outcome.status.clone();
                Some(entry)
            }
            None => Some(entry),
        })
        .collect();
    BindStatus {
        load_balancer_statuses,
    }
}

fn target_record_id(bind: &Bind, target: &str) -> String {
    format!(
        "{}/{}/{}",
        bind.namespace().unwrap_or_default(),
        bind.name_any(),
        target
    )
}

/// Records a Bind should own given the current target statuses
pub fn expected_records(ctx: &Context, bind: &Bind, status: &BindStatus) -> Vec<BackendRecord> {
    if is_deleting(bind) {
        return Vec::new();
    }
    let namespace = bind.namespace().unwrap_or_default();
    let owner = RecordOwner::of(OwnerKind::Bind, bind);
    let settings = BackendSettings {
        parameters: bind.spec.parameters.clone(),
        ensure_policy: bind.spec.ensure_policy.clone(),
    };
    let pods = select_pods(
        ctx.pods.as_ref(),
        &namespace,
        bind.spec.pods.by_label.as_ref(),
        bind.spec.pods.by_name.as_deref(),
    );

    let attributes: HashMap<&str, &StringMap> = bind
        .spec
        .load_balancers
        .iter()
        .map(|t| (t.name.as_str(), &t.attributes))
        .collect();

    let mut expected = Vec::new();
    for entry in &status.load_balancer_statuses {
        if entry.deleting || !is_condition_true(&entry.state.conditions, condition_types::CREATED) {
            continue;
        }
        let target = AttachTarget {
            lb_name: entry.name.clone(),
            lb_driver: entry.driver.clone(),
            lb_info: entry.state.lb_info.clone(),
            lb_attributes: attributes
                .get(entry.name.as_str())
                .map(|a| (*a).clone())
                .unwrap_or_default(),
        };
        for pod in &pods {
            for port in &bind.spec.pods.ports {
                let backend = BackendDescriptor::Pod {
                    name: pod.name_any(),
                    port: port.clone(),
                };
                expected.push(build_record(&owner, &target, backend, &settings));
            }
        }
    }
    expected
}

/// Reconcile one Bind
#[instrument(skip(ctx))]
pub async fn reconcile_bind(ctx: &Context, namespace: &str, name: &str) -> Result<SyncResult> {
    let Some(cached) = ctx.binds.cached(namespace, name) else {
        return Ok(SyncResult::Finished);
    };
    let mut bind = (*cached).clone();
    let deleting = is_deleting(&bind);

    if deleting && !has_finalizer(&bind, FINALIZER_DELETE_LB) {
        return Ok(SyncResult::Finished);
    }
    if !deleting && !has_finalizer(&bind, FINALIZER_DELETE_LB) {
        match update_with_retry(
            ctx.binds.as_ref(),
            bind,
            ctx.conflict_retries(),
            |obj| add_finalizer(obj, FINALIZER_DELETE_LB),
        )
        .await?
        {
            Some(updated) => bind = updated,
            None => return Ok(SyncResult::Finished),
        }
    }

    let owner = RecordOwner::of(OwnerKind::Bind, &bind);
    let existing = owner.owned_records(ctx);
    let planned = plan_targets(&bind);

    // a deleting target waits until its backends are gone
    let lb_with_records: HashSet<String> = existing
        .iter()
        .filter_map(|r| r.labels().get(LABEL_LB_NAME).cloned())
        .collect();
    let mut waiting = false;
    let mut drivers: HashMap<String, DriverRef> = HashMap::new();
    for entry in &planned {
        if entry.deleting && lb_with_records.contains(&entry.name) {
            waiting = true;
            continue;
        }
        drivers.insert(entry.name.clone(), ctx.driver_ref(namespace, &entry.driver)?);
    }

    let spec_by_name: HashMap<&str, _> = bind
        .spec
        .load_balancers
        .iter()
        .map(|t| (t.name.as_str(), t))
        .collect();
    let empty = StringMap::new();
    let targets: Vec<(String, LoadBalancerTarget<'_>, &TargetLoadBalancerStatus)> = planned
        .iter()
        .filter_map(|entry| {
            let driver = drivers.get(&entry.name)?;
            let attributes = spec_by_name
                .get(entry.name.as_str())
                .map(|t| &t.attributes)
                .unwrap_or(&empty);
            Some((
                entry.name.clone(),
                LoadBalancerTarget {
                    record_id: target_record_id(&bind, &entry.name),
                    driver,
                    lb_spec: &entry.spec,
                    attributes,
                    ensure_policy: bind.spec.ensure_policy.as_ref(),
                    deleting: entry.deleting,
                },
                entry,
            ))
        })
        .collect();

    let client = &ctx.driver_client;
    let results = join_all(targets.iter().map(|(name, target, entry)| async move {
        let outcome = sync_target(client, target, &entry.state).await;
        (name.clone(), outcome)
    }))
    .await;
    let outcomes: HashMap<String, TargetOutcome> = results.into_iter().collect();

    for outcome in outcomes.values() {
        for event in &outcome.events {
            ctx.publish_event(&bind, event).await;
        }
    }

    let mut result = outcomes
        .values()
        .fold(SyncResult::Finished, |acc, o| acc.merge(o.result.clone()));
    if waiting {
        result = result.merge(SyncResult::running(BACKEND_CLEANUP_RECHECK));
    }

    let status = merge_statuses(planned, &outcomes);
    let current = bind.status.clone().unwrap_or_default();
    let bind = if status != current {
        let new_status = status.clone();
        match update_status_with_retry(
            ctx.binds.as_ref(),
            bind,
            ctx.conflict_retries(),
            move |obj| {
                if obj.status.as_ref() == Some(&new_status) {
                    return false;
                }
                obj.status = Some(new_status.clone());
                true
            },
        )
        .await?
        {
            Some(updated) => updated,
            None => return Ok(SyncResult::Finished),
        }
    } else {
        bind
    };

    let expected = expected_records(ctx, &bind, &status);
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

    if deleting && status.load_balancer_statuses.is_empty() && existing.is_empty() {
        info!("All load balancers deleted, releasing Bind");
        update_with_retry(
            ctx.binds.as_ref(),
            bind,
            ctx.conflict_retries(),
            |obj| remove_finalizer(obj, FINALIZER_DELETE_LB),
        )
        .await?;
        return Ok(SyncResult::Finished);
    }

    debug!(result = result.kind(), "Bind synced");
    Ok(result)
}
