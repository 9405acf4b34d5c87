//! LoadBalancer lifecycle
//!
//! [`sync_target`] runs one step of the load balancer state machine against a
//! driver and returns the status it should have afterwards. It touches no
//! shared state, so a Bind can run it for all of its targets concurrently.
//! [`reconcile_load_balancer`] wraps it for standalone LoadBalancer objects.

use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::controller::Context;
use crate::controller::conditions::{
    condition_types, is_condition_true, new_condition, reasons, set_condition,
};
use crate::controller::error::Result;
use crate::controller::events::{LifecycleEvent, actions, reasons as event_reasons};
use crate::controller::sync_result::SyncResult;
use crate::crd::{
    ConditionStatus, EnsurePolicy, FINALIZER_DELETE_LB, LABEL_BIND, LABEL_LB_NAME, LoadBalancer,
    LoadBalancerStatus, StringMap, wants_periodic,
};
use crate::driver::protocol::{CreateLoadBalancerRequest, LoadBalancerRequest};
use crate::driver::{DriverClient, DriverRef, OperationOutcome, RetryIds, TransportError};
use crate::store::{
    add_finalizer, has_finalizer, is_deleting, remove_finalizer, update_status_with_retry,
    update_with_retry,
};

/// Recheck delay while waiting for backends of a deleting load balancer to go away
pub const BACKEND_CLEANUP_RECHECK: Duration = Duration::from_secs(5);

/// Desired state of one load balancer
#[derive(Clone, Debug)]
pub struct LoadBalancerTarget<'a> {
    /// Stable identifier of the logical operation, sent as `recordID`
    pub record_id: String,
    pub driver: &'a DriverRef,
    pub lb_spec: &'a StringMap,
    pub attributes: &'a StringMap,
    pub ensure_policy: Option<&'a EnsurePolicy>,
    /// The load balancer must be deleted
    pub deleting: bool,
}

/// Result of one lifecycle step
#[derive(Clone, Debug)]
pub struct TargetOutcome {
    pub status: LoadBalancerStatus,
    pub result: SyncResult,
    /// The driver confirmed deletion; the deletion guard may be cleared
    pub deleted: bool,
    pub events: Vec<LifecycleEvent>,
}

impl TargetOutcome {
    fn new(status: LoadBalancerStatus, result: SyncResult) -> Self {
        Self {
            status,
            result,
            deleted: false,
            events: Vec::new(),
        }
    }

    fn with_event(mut self, event: LifecycleEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Unknown remote outcome: status is left exactly as it was
    fn transport_error(
        current: &LoadBalancerStatus,
        action: &'static str,
        err: &TransportError,
    ) -> Self {
        Self::new(current.clone(), SyncResult::from_transport(err)).with_event(
            LifecycleEvent::warning(event_reasons::WEBHOOK_ERROR, action, err.to_string()),
        )
    }
}

fn retry_at(after: Duration) -> String {
    let after = chrono::Duration::from_std(after).unwrap_or(chrono::Duration::zero());
    (Utc::now() + after).to_rfc3339()
}

/// Run one lifecycle step for a load balancer
///
/// A transport error at any step leaves the status untouched. A Fail or
/// Running outcome never reverts a Created condition that is already True.
pub async fn sync_target(
    client: &DriverClient,
    target: &LoadBalancerTarget<'_>,
    current: &LoadBalancerStatus,
) -> TargetOutcome {
    if target.deleting {
        return delete_step(client, target, current).await;
    }
    if !is_condition_true(&current.conditions, condition_types::CREATED) {
        return create_step(client, target, current).await;
    }
    if target.attributes != &current.last_synced_attributes
        || wants_periodic(target.ensure_policy)
    {
        return ensure_step(client, target, current).await;
    }
    TargetOutcome::new(current.clone(), SyncResult::done(target.ensure_policy))
}

async fn delete_step(
    client: &DriverClient,
    target: &LoadBalancerTarget<'_>,
    current: &LoadBalancerStatus,
) -> TargetOutcome {
    let req = LoadBalancerRequest {
        ids: RetryIds::new(&target.record_id),
        lb_info: current.lb_info.clone(),
        attributes: target.attributes.clone(),
    };
    let outcome = match client.delete_load_balancer(target.driver, &req).await {
        Ok(outcome) => outcome,
        Err(e) => return TargetOutcome::transport_error(current, actions::DELETE, &e),
    };

    let mut status = current.clone();
    match &outcome {
        OperationOutcome::Succ => {
            status.retry_after = None;
            let mut done = TargetOutcome::new(status, SyncResult::Finished).with_event(
                LifecycleEvent::normal(
                    event_reasons::LOAD_BALANCER_DELETED,
                    actions::DELETE,
                    format!("deleted by driver {}", target.driver.name),
                ),
            );
            done.deleted = true;
            done
        }
        OperationOutcome::Fail { msg, retry_after } => {
            status.retry_after = Some(retry_at(*retry_after));
            set_condition(
                &mut status.conditions,
                new_condition(
                    condition_types::READY,
                    ConditionStatus::False,
                    reasons::DELETE_FAILED,
                    msg.clone(),
                ),
            );
            TargetOutcome::new(status, SyncResult::from_outcome(&outcome)).with_event(
                LifecycleEvent::warning(event_reasons::DRIVER_FAILED, actions::DELETE, msg.clone()),
            )
        }
        OperationOutcome::Running { .. } => {
            TargetOutcome::new(status, SyncResult::from_outcome(&outcome))
        }
    }
}

async fn create_step(
    client: &DriverClient,
    target: &LoadBalancerTarget<'_>,
    current: &LoadBalancerStatus,
) -> TargetOutcome {
    let req = CreateLoadBalancerRequest {
        ids: RetryIds::new(&target.record_id),
        lb_spec: target.lb_spec.clone(),
        attributes: target.attributes.clone(),
    };
    let created = match client.create_load_balancer(target.driver, &req).await {
        Ok(created) => created,
        Err(e) => return TargetOutcome::transport_error(current, actions::CREATE, &e),
    };

    let mut status = current.clone();
    match &created.outcome {
        OperationOutcome::Succ => {
            // drivers that keep no handle of their own are addressed by the spec
            status.lb_info = if created.lb_info.is_empty() {
                target.lb_spec.clone()
            } else {
                created.lb_info
            };
            status.last_synced_attributes = target.attributes.clone();
            status.retry_after = None;
            set_condition(
                &mut status.conditions,
                new_condition(
                    condition_types::CREATED,
                    ConditionStatus::True,
                    reasons::SUCCEEDED,
                    "",
                ),
            );
            set_condition(
                &mut status.conditions,
                new_condition(
                    condition_types::READY,
                    ConditionStatus::True,
                    reasons::SUCCEEDED,
                    "",
                ),
            );
            TargetOutcome::new(status, SyncResult::done(target.ensure_policy)).with_event(
                LifecycleEvent::normal(
                    event_reasons::LOAD_BALANCER_CREATED,
                    actions::CREATE,
                    format!("created by driver {}", target.driver.name),
                ),
            )
        }
        OperationOutcome::Fail { msg, retry_after } => {
            status.retry_after = Some(retry_at(*retry_after));
            set_condition(
                &mut status.conditions,
                new_condition(
                    condition_types::CREATED,
                    ConditionStatus::False,
                    reasons::CREATE_FAILED,
                    msg.clone(),
                ),
            );
            TargetOutcome::new(status, SyncResult::from_outcome(&created.outcome)).with_event(
                LifecycleEvent::warning(event_reasons::DRIVER_FAILED, actions::CREATE, msg.clone()),
            )
        }
        OperationOutcome::Running { msg, .. } => {
            set_condition(
                &mut status.conditions,
                new_condition(
                    condition_types::CREATED,
                    ConditionStatus::False,
                    reasons::IN_PROGRESS,
                    msg.clone(),
                ),
            );
            TargetOutcome::new(status, SyncResult::from_outcome(&created.outcome))
        }
    }
}

async fn ensure_step(
    client: &DriverClient,
    target: &LoadBalancerTarget<'_>,
    current: &LoadBalancerStatus,
) -> TargetOutcome {
    let req = LoadBalancerRequest {
        ids: RetryIds::new(&target.record_id),
        lb_info: current.lb_info.clone(),
        attributes: target.attributes.clone(),
    };
    let outcome = match client.ensure_load_balancer(target.driver, &req).await {
        Ok(outcome) => outcome,
        Err(e) => return TargetOutcome::transport_error(current, actions::ENSURE, &e),
    };

    let mut status = current.clone();
    match &outcome {
        OperationOutcome::Succ => {
            status.last_synced_attributes = target.attributes.clone();
            status.retry_after = None;
            set_condition(
                &mut status.conditions,
                new_condition(
                    condition_types::READY,
                    ConditionStatus::True,
                    reasons::SUCCEEDED,
                    "",
                ),
            );
            TargetOutcome::new(status, SyncResult::done(target.ensure_policy))
        }
        OperationOutcome::Fail { msg, retry_after } => {
            status.retry_after = Some(retry_at(*retry_after));
            set_condition(
                &mut status.conditions,
                new_condition(
                    condition_types::READY,
                    ConditionStatus::False,
                    reasons::ENSURE_FAILED,
                    msg.clone(),
                ),
            );
            TargetOutcome::new(status, SyncResult::from_outcome(&outcome)).with_event(
                LifecycleEvent::warning(event_reasons::DRIVER_FAILED, actions::ENSURE, msg.clone()),
            )
        }
        OperationOutcome::Running { msg, .. } => {
            // a serving load balancer stays Ready while the driver works
            if !is_condition_true(&status.conditions, condition_types::READY) {
                set_condition(
                    &mut status.conditions,
                    new_condition(
                        condition_types::READY,
                        ConditionStatus::False,
                        reasons::IN_PROGRESS,
                        msg.clone(),
                    ),
                );
            }
            TargetOutcome::new(status, SyncResult::from_outcome(&outcome))
        }
    }
}

/// Whether a LoadBalancer is created and not being deleted
pub fn is_load_balancer_usable(lb: &LoadBalancer) -> bool {
    !is_deleting(lb)
        && lb
            .status
            .as_ref()
            .is_some_and(|s| is_condition_true(&s.conditions, condition_types::CREATED))
}

/// Reconcile one LoadBalancer object
#[instrument(skip(ctx))]
pub async fn reconcile_load_balancer(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<SyncResult> {
    let Some(cached) = ctx.load_balancers.cached(namespace, name) else {
        debug!("LoadBalancer no longer exists");
        return Ok(SyncResult::Finished);
    };
    let mut lb = (*cached).clone();
    let deleting = is_deleting(&lb);

    if deleting && !has_finalizer(&lb, FINALIZER_DELETE_LB) {
        return Ok(SyncResult::Finished);
    }

    if !deleting && !has_finalizer(&lb, FINALIZER_DELETE_LB) {
        match update_with_retry(
            ctx.load_balancers.as_ref(),
            lb,
            ctx.conflict_retries(),
            |obj| add_finalizer(obj, FINALIZER_DELETE_LB),
        )
        .await?
        {
            Some(updated) => lb = updated,
            None => return Ok(SyncResult::Finished),
        }
    }

    if deleting {
        let remaining = delete_attached_records(ctx, namespace, name).await?;
        if remaining > 0 {
            info!(remaining, "Waiting for backends to be deregistered before deleting load balancer");
            return Ok(SyncResult::running(BACKEND_CLEANUP_RECHECK));
        }
    }

    let driver = ctx.driver_ref(namespace, &lb.spec.lb_driver)?;
    let current = lb.status.clone().unwrap_or_default();
    let target = LoadBalancerTarget {
        record_id: format!("{}/{}", namespace, name),
        driver: &driver,
        lb_spec: &lb.spec.lb_spec,
        attributes: &lb.spec.attributes,
        ensure_policy: lb.spec.ensure_policy.as_ref(),
        deleting,
    };

    let outcome = sync_target(&ctx.driver_client, &target, &current).await;
    for event in &outcome.events {
        ctx.publish_event(&lb, event).await;
    }

    let lb = if outcome.status != current {
        let status = outcome.status.clone();
        match update_status_with_retry(
            ctx.load_balancers.as_ref(),
            lb,
            ctx.conflict_retries(),
            move |obj| {
                if obj.status.as_ref() == Some(&status) {
                    return false;
                }
                obj.status = Some(status.clone());
                true
            },
        )
        .await?
        {
            Some(updated) => updated,
            None => return Ok(SyncResult::Finished),
        }
    } else {
        lb
    };

    if outcome.deleted {
        info!("Load balancer deleted by driver, releasing finalizer");
        update_with_retry(
            ctx.load_balancers.as_ref(),
            lb,
            ctx.conflict_retries(),
            |obj| remove_finalizer(obj, FINALIZER_DELETE_LB),
        )
        .await?;
    }

    if outcome.result.is_failed() {
        warn!(result = ?outcome.result, "LoadBalancer sync failed");
    }
    Ok(outcome.result)
}

/// Delete BackendRecords attached to a standalone load balancer; returns how many remain
async fn delete_attached_records(ctx: &Context, namespace: &str, lb_name: &str) -> Result<usize> {
    let attached: Vec<_> = ctx
        .backend_records
        .cached_list(namespace)
        .into_iter()
        .filter(|r| {
            let labels = r.labels();
            labels.get(LABEL_LB_NAME).map(String::as_str) == Some(lb_name)
                && !labels.contains_key(LABEL_BIND)
        })
        .collect();

    for record in attached.iter().filter(|r| !is_deleting(r.as_ref())) {
        ctx.backend_records
            .delete(namespace, &record.name_any())
            .await?;
    }
    Ok(attached.len())
}
