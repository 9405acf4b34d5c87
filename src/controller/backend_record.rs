//! BackendRecord lifecycle
//!
//! A record moves from address generation to registration, and is
//! deregistered before its deletion guard is released. The status is computed
//! in memory and written once at the end of a pass, so a transport error late
//! in the pass never discards a definite result obtained earlier in it.

use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::controller::Context;
use crate::controller::conditions::{
    condition_types, has_condition, is_condition_true, new_condition, reasons, set_condition,
};
use crate::controller::error::{Error, Result};
use crate::controller::events::{LifecycleEvent, actions, reasons as event_reasons};
use crate::controller::sync_result::SyncResult;
use crate::crd::{
    BackendDescriptor, BackendRecord, BackendRecordStatus, ConditionStatus, FINALIZER_DEREGISTER,
    wants_periodic,
};
use crate::driver::protocol::{BackendRequest, GenerateBackendAddrRequest, GenerateTarget};
use crate::driver::{DriverRef, OperationOutcome, RetryIds};
use crate::store::{
    add_finalizer, has_finalizer, is_deleting, remove_finalizer, update_status_with_retry,
    update_with_retry,
};

/// Recheck delay while a predecessor sharing the address deregisters
pub const DELAYED_ENSURE_RECHECK: Duration = Duration::from_secs(5);

/// Stable operation identifier of a record
fn record_id(record: &BackendRecord) -> String {
    format!(
        "{}/{}",
        record.namespace().unwrap_or_default(),
        record.name_any()
    )
}

fn backend_request(record: &BackendRecord, backend_addr: &str) -> BackendRequest {
    BackendRequest {
        ids: RetryIds::new(record_id(record)),
        backend_addr: backend_addr.to_string(),
        lb_info: record.spec.lb_info.clone(),
        lb_attributes: record.spec.lb_attributes.clone(),
        parameters: record.spec.parameters.clone(),
    }
}

/// Another live record for the same load balancer that is still deregistering `addr`
pub fn find_deregistering_predecessor(
    ctx: &Context,
    record: &BackendRecord,
    addr: &str,
) -> Option<String> {
    let namespace = record.namespace().unwrap_or_default();
    let name = record.name_any();
    ctx.backend_records
        .cached_list(&namespace)
        .into_iter()
        .find(|other| {
            other.name_any() != name
                && other.spec.lb_name == record.spec.lb_name
                && other.spec.lb_driver == record.spec.lb_driver
                && other.backend_addr() == Some(addr)
                && is_deleting(other.as_ref())
                && has_finalizer(other.as_ref(), FINALIZER_DEREGISTER)
        })
        .map(|other| other.name_any())
}

/// Concrete backend handed to generateBackendAddr
fn generate_target(ctx: &Context, record: &BackendRecord) -> Result<GenerateTarget> {
    let namespace = record.namespace().unwrap_or_default();
    match &record.spec.backend {
        BackendDescriptor::Pod { name, .. } => {
            let pod = ctx
                .pods
                .cached(&namespace, name)
                .ok_or_else(|| Error::NotFound(format!("Pod {}/{}", namespace, name)))?;
            Ok(GenerateTarget::Pod(serde_json::to_value(pod.as_ref())?))
        }
        BackendDescriptor::Service {
            name,
            node_name,
            port,
        } => {
            let service = ctx
                .services
                .cached(&namespace, name)
                .ok_or_else(|| Error::NotFound(format!("Service {}/{}", namespace, name)))?;
            let node = ctx
                .nodes
                .cached("", node_name)
                .ok_or_else(|| Error::NotFound(format!("Node {}", node_name)))?;
            Ok(GenerateTarget::Service {
                service: serde_json::to_value(service.as_ref())?,
                node: serde_json::to_value(node.as_ref())?,
                port: port.port_number,
                protocol: port.protocol.clone(),
            })
        }
        BackendDescriptor::Static { addr } => Ok(GenerateTarget::Static(addr.clone())),
    }
}

/// Registered is only written on a retry loop when nothing was recorded yet
fn set_registered_if_unset(status: &mut BackendRecordStatus, reason: &str, msg: &str) {
    if !has_condition(&status.conditions, condition_types::REGISTERED) {
        set_condition(
            &mut status.conditions,
            new_condition(
                condition_types::REGISTERED,
                ConditionStatus::False,
                reason,
                msg,
            ),
        );
    }
}

/// One pass over a record; returns the result and the status it should have
struct RecordPass<'a> {
    ctx: &'a Context,
    record: &'a BackendRecord,
    driver: DriverRef,
    status: BackendRecordStatus,
    events: Vec<LifecycleEvent>,
}

impl RecordPass<'_> {
    async fn deregister(&mut self, addr: &str) -> SyncResult {
        let req = backend_request(self.record, addr);
        let outcome = match self
            .ctx
            .driver_client
            .deregister_backend(&self.driver, &req)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.push(LifecycleEvent::warning(
                    event_reasons::WEBHOOK_ERROR,
                    actions::DEREGISTER,
                    e.to_string(),
                ));
                return SyncResult::from_transport(&e);
            }
        };

        match &outcome {
            OperationOutcome::Succ => {
                self.events.push(LifecycleEvent::normal(
                    event_reasons::BACKEND_DEREGISTERED,
                    actions::DEREGISTER,
                    format!("{} deregistered from {}", addr, self.record.spec.lb_name),
                ));
            }
            OperationOutcome::Fail { msg, .. } => {
                set_condition(
                    &mut self.status.conditions,
                    new_condition(
                        condition_types::REGISTERED,
                        ConditionStatus::Unknown,
                        reasons::DEREGISTER_FAILED,
                        msg.clone(),
                    ),
                );
                self.events.push(LifecycleEvent::warning(
                    event_reasons::DRIVER_FAILED,
                    actions::DEREGISTER,
                    msg.clone(),
                ));
            }
            OperationOutcome::Running { .. } => {}
        }
        SyncResult::from_outcome(&outcome)
    }

    async fn generate_addr(&mut self) -> Result<SyncResult> {
        let target = generate_target(self.ctx, self.record)?;
        let req = GenerateBackendAddrRequest {
            ids: RetryIds::new(record_id(self.record)),
            lb_info: self.record.spec.lb_info.clone(),
            lb_attributes: self.record.spec.lb_attributes.clone(),
            target,
        };
        let generated = match self
            .ctx
            .driver_client
            .generate_backend_addr(&self.driver, &req)
            .await
        {
            Ok(generated) => generated,
            Err(e) => {
                self.events.push(LifecycleEvent::warning(
                    event_reasons::WEBHOOK_ERROR,
                    actions::GENERATE_ADDR,
                    e.to_string(),
                ));
                return Ok(SyncResult::from_transport(&e));
            }
        };

        match (&generated.outcome, generated.backend_addr) {
            (OperationOutcome::Succ, Some(addr)) => {
                debug!(backend_addr = %addr, "Driver generated backend address");
                self.status.backend_addr = Some(addr);
                set_condition(
                    &mut self.status.conditions,
                    new_condition(
                        condition_types::ADDR_GENERATED,
                        ConditionStatus::True,
                        reasons::SUCCEEDED,
                        "",
                    ),
                );
                Ok(SyncResult::Finished)
            }
            (OperationOutcome::Succ, None) => {
                // a Succ without an address is a malformed answer
                let reason = "driver returned Succ without backendAddr";
                self.events.push(LifecycleEvent::warning(
                    event_reasons::WEBHOOK_ERROR,
                    actions::GENERATE_ADDR,
                    reason,
                ));
                Ok(SyncResult::failed(reason))
            }
            (OperationOutcome::Fail { msg, .. }, _) => {
                set_registered_if_unset(&mut self.status, reasons::GENERATE_ADDR_FAILED, msg);
                self.events.push(LifecycleEvent::warning(
                    event_reasons::DRIVER_FAILED,
                    actions::GENERATE_ADDR,
                    msg.clone(),
                ));
                Ok(SyncResult::from_outcome(&generated.outcome))
            }
            (OperationOutcome::Running { msg, .. }, _) => {
                set_registered_if_unset(&mut self.status, reasons::IN_PROGRESS, msg);
                Ok(SyncResult::from_outcome(&generated.outcome))
            }
        }
    }

    fn needs_ensure(&self) -> bool {
        wants_periodic(self.record.spec.ensure_policy.as_ref())
            || !is_condition_true(&self.status.conditions, condition_types::REGISTERED)
            || self.status.observed_generation != self.record.metadata.generation
    }

    async fn ensure(&mut self, addr: &str) -> SyncResult {
        if !self.needs_ensure() {
            return SyncResult::Finished;
        }

        if let Some(predecessor) = find_deregistering_predecessor(self.ctx, self.record, addr) {
            info!(
                backend_addr = %addr,
                predecessor = %predecessor,
                "Delaying ensure until predecessor is deregistered"
            );
            set_registered_if_unset(
                &mut self.status,
                reasons::DELAYED_ENSURE,
                &format!("waiting for {} to deregister {}", predecessor, addr),
            );
            return SyncResult::running(DELAYED_ENSURE_RECHECK);
        }

        let req = backend_request(self.record, addr);
        let outcome = match self
            .ctx
            .driver_client
            .ensure_backend(&self.driver, &req)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.push(LifecycleEvent::warning(
                    event_reasons::WEBHOOK_ERROR,
                    actions::REGISTER,
                    e.to_string(),
                ));
                return SyncResult::from_transport(&e);
            }
        };

        match &outcome {
            OperationOutcome::Succ => {
                let was_registered =
                    is_condition_true(&self.status.conditions, condition_types::REGISTERED);
                set_condition(
                    &mut self.status.conditions,
                    new_condition(
                        condition_types::REGISTERED,
                        ConditionStatus::True,
                        reasons::SUCCEEDED,
                        "",
                    ),
                );
                self.status.observed_generation = self.record.metadata.generation;
                if !was_registered {
                    self.events.push(LifecycleEvent::normal(
                        event_reasons::BACKEND_REGISTERED,
                        actions::REGISTER,
                        format!("{} registered to {}", addr, self.record.spec.lb_name),
                    ));
                }
                SyncResult::done(self.record.spec.ensure_policy.as_ref())
            }
            OperationOutcome::Fail { msg, .. } => {
                set_condition(
                    &mut self.status.conditions,
                    new_condition(
                        condition_types::REGISTERED,
                        ConditionStatus::False,
                        reasons::REGISTER_FAILED,
                        msg.clone(),
                    ),
                );
                self.events.push(LifecycleEvent::warning(
                    event_reasons::DRIVER_FAILED,
                    actions::REGISTER,
                    msg.clone(),
                ));
                SyncResult::from_outcome(&outcome)
            }
            OperationOutcome::Running { msg, .. } => {
                set_registered_if_unset(&mut self.status, reasons::IN_PROGRESS, msg);
                SyncResult::from_outcome(&outcome)
            }
        }
    }
}

/// Reconcile one BackendRecord
#[instrument(skip(ctx))]
pub async fn reconcile_backend_record(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<SyncResult> {
    let Some(cached) = ctx.backend_records.cached(namespace, name) else {
        return Ok(SyncResult::Finished);
    };
    let mut record = (*cached).clone();
    let deleting = is_deleting(&record);

    if deleting {
        if !has_finalizer(&record, FINALIZER_DEREGISTER) {
            return Ok(SyncResult::Finished);
        }
        if record.backend_addr().is_none() {
            // nothing was ever registered remotely
            debug!("Releasing record that never got an address");
            release_guard(ctx, record).await?;
            return Ok(SyncResult::Finished);
        }
    } else if !has_finalizer(&record, FINALIZER_DEREGISTER) {
        match update_with_retry(
            ctx.backend_records.as_ref(),
            record,
            ctx.conflict_retries(),
            |obj| add_finalizer(obj, FINALIZER_DEREGISTER),
        )
        .await?
        {
            Some(updated) => record = updated,
            None => return Ok(SyncResult::Finished),
        }
    }

    let driver = ctx.driver_ref(namespace, &record.spec.lb_driver)?;
    let current = record.status.clone().unwrap_or_default();
    let mut pass = RecordPass {
        ctx,
        record: &record,
        driver,
        status: current.clone(),
        events: Vec::new(),
    };

    let mut deregistered = false;
    let result = if deleting {
        let addr = pass.status.backend_addr.clone().unwrap_or_default();
        let result = pass.deregister(&addr).await;
        deregistered = result.is_finished();
        result
    } else {
        let mut result = SyncResult::Finished;
        if pass.status.backend_addr.as_deref().unwrap_or_default().is_empty() {
            result = pass.generate_addr().await?;
        }
        match pass.status.backend_addr.clone().filter(|a| !a.is_empty()) {
            Some(addr) if result.is_finished() => pass.ensure(&addr).await,
            _ => result,
        }
    };

    let RecordPass { status, events, .. } = pass;
    for event in &events {
        ctx.publish_event(&record, event).await;
    }

    let record = if status != current {
        let new_status = status.clone();
        match update_status_with_retry(
            ctx.backend_records.as_ref(),
            record,
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
        record
    };

    if deregistered {
        release_guard(ctx, record).await?;
    }

    debug!(result = result.kind(), "BackendRecord synced");
    Ok(result)
}

async fn release_guard(ctx: &Context, record: BackendRecord) -> Result<()> {
    update_with_retry(
        ctx.backend_records.as_ref(),
        record,
        ctx.conflict_retries(),
        |obj| remove_finalizer(obj, FINALIZER_DEREGISTER),
    )
    .await?;
    Ok(())
}
