//! Admission rules for LBCF objects
//!
//! These checks reject malformed or illegally changed objects before they are
//! persisted, so the reconcilers never see them. They are plain functions; the
//! admission HTTP endpoints that call them live outside this crate.

use std::collections::HashSet;

use crate::controller::error::{Error, Result};
use crate::crd::{
    BackendGroup, Bind, EnsurePolicy, LoadBalancer, LoadBalancerDriver, MIN_RESYNC_PERIOD_SECS,
    PortSelector, StringMap,
};
use crate::driver::protocol::{
    ValidateBackendRequest, ValidateLoadBalancerRequest, ValidateOperation,
};
use crate::driver::{DriverClient, DriverRef, Operation, parse_duration};

/// Driver type accepted by this controller
pub const DRIVER_TYPE_WEBHOOK: &str = "Webhook";

fn invalid(msg: impl Into<String>) -> Error {
    Error::ValidationError(msg.into())
}

/// Validate a LoadBalancerDriver
pub fn validate_driver(driver: &LoadBalancerDriver) -> Result<()> {
    let spec = &driver.spec;
    if spec.driver_type != DRIVER_TYPE_WEBHOOK {
        return Err(invalid(format!(
            "unsupported driverType {:?}, only {} is supported",
            spec.driver_type, DRIVER_TYPE_WEBHOOK
        )));
    }
    if !(spec.url.starts_with("http://") || spec.url.starts_with("https://")) {
        return Err(invalid(format!("url {:?} must be http(s)", spec.url)));
    }

    let mut seen = HashSet::new();
    for hook in &spec.webhooks {
        let op = Operation::from_name(&hook.name)
            .ok_or_else(|| invalid(format!("unknown webhook {:?}", hook.name)))?;
        if !seen.insert(op) {
            return Err(invalid(format!("webhook {} declared twice", op)));
        }
        if let Some(raw) = &hook.timeout {
            let timeout = parse_duration(raw)
                .ok_or_else(|| invalid(format!("webhook {}: invalid timeout {:?}", op, raw)))?;
            let (min, max) = op.timeout_bounds();
            if timeout < min || timeout > max {
                return Err(invalid(format!(
                    "webhook {}: timeout {:?} outside [{:?}, {:?}]",
                    op, timeout, min, max
                )));
            }
        }
    }
    Ok(())
}

/// Validate an ensure policy
pub fn validate_ensure_policy(policy: Option<&EnsurePolicy>) -> Result<()> {
    let Some(policy) = policy else {
        return Ok(());
    };
    if let Some(secs) = policy.resync_period_in_seconds {
        if policy.is_always() && secs < MIN_RESYNC_PERIOD_SECS {
            return Err(invalid(format!(
                "resyncPeriodInSeconds {} is below minimum {}",
                secs, MIN_RESYNC_PERIOD_SECS
            )));
        }
    }
    Ok(())
}

fn validate_keys(what: &str, map: &StringMap) -> Result<()> {
    if map.keys().any(|k| k.trim().is_empty()) {
        return Err(invalid(format!("{} contains an empty key", what)));
    }
    Ok(())
}

fn validate_port(port: &PortSelector) -> Result<()> {
    if !(1..=65535).contains(&port.port_number) {
        return Err(invalid(format!("port {} out of range", port.port_number)));
    }
    if !matches!(port.protocol.as_str(), "TCP" | "UDP") {
        return Err(invalid(format!("unsupported protocol {:?}", port.protocol)));
    }
    Ok(())
}

fn validate_pod_selector(by_label: bool, by_name: Option<&[String]>) -> Result<()> {
    match (by_label, by_name) {
        (true, None) => Ok(()),
        (false, Some(names)) if !names.is_empty() => Ok(()),
        (false, Some(_)) => Err(invalid("byName must list at least one pod")),
        _ => Err(invalid("exactly one of byLabel and byName must be set")),
    }
}

/// Validate a LoadBalancer
pub fn validate_load_balancer(lb: &LoadBalancer) -> Result<()> {
    if lb.spec.lb_driver.is_empty() {
        return Err(invalid("lbDriver is required"));
    }
    validate_keys("attributes", &lb.spec.attributes)?;
    validate_ensure_policy(lb.spec.ensure_policy.as_ref())
}

/// Validate a LoadBalancer update: the driver and the spec are immutable
pub fn validate_load_balancer_update(old: &LoadBalancer, new: &LoadBalancer) -> Result<()> {
    if old.spec.lb_driver != new.spec.lb_driver {
        return Err(invalid("lbDriver is immutable"));
    }
    if old.spec.lb_spec != new.spec.lb_spec {
        return Err(invalid("lbSpec is immutable"));
    }
    validate_load_balancer(new)
}

/// Which kind of backend a group selects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorShape {
    PodsByLabel,
    PodsByName,
    Service,
    Static,
}

/// Shape of a group's backend selector; exactly one selector must be set
pub fn selector_shape(group: &BackendGroup) -> Result<SelectorShape> {
    let spec = &group.spec;
    let set = [
        spec.pods.is_some(),
        spec.service.is_some(),
        spec.static_addrs.is_some(),
    ]
    .iter()
    .filter(|s| **s)
    .count();
    if set != 1 {
        return Err(invalid("exactly one of pods, service and static must be set"));
    }

    if let Some(pods) = &spec.pods {
        validate_pod_selector(pods.by_label.is_some(), pods.by_name.as_deref())?;
        return Ok(if pods.by_label.is_some() {
            SelectorShape::PodsByLabel
        } else {
            SelectorShape::PodsByName
        });
    }
    if spec.service.is_some() {
        return Ok(SelectorShape::Service);
    }
    Ok(SelectorShape::Static)
}

/// Validate a BackendGroup
pub fn validate_backend_group(group: &BackendGroup) -> Result<()> {
    let spec = &group.spec;
    if spec.load_balancers.is_empty() {
        return Err(invalid("loadBalancers must not be empty"));
    }
    let unique: HashSet<&String> = spec.load_balancers.iter().collect();
    if unique.len() != spec.load_balancers.len() {
        return Err(invalid("loadBalancers contains duplicates"));
    }

    selector_shape(group)?;
    if let Some(pods) = &spec.pods {
        validate_port(&pods.port)?;
    }
    if let Some(svc) = &spec.service {
        if svc.name.is_empty() {
            return Err(invalid("service.name is required"));
        }
        validate_port(&svc.port)?;
    }
    if let Some(addrs) = &spec.static_addrs {
        if addrs.is_empty() || addrs.iter().any(|a| a.is_empty()) {
            return Err(invalid("static must list non-empty addresses"));
        }
    }
    validate_keys("parameters", &spec.parameters)?;
    validate_ensure_policy(spec.ensure_policy.as_ref())
}

/// Validate a BackendGroup update: the selector shape is immutable
pub fn validate_backend_group_update(old: &BackendGroup, new: &BackendGroup) -> Result<()> {
    validate_backend_group(new)?;
    let (old_shape, new_shape) = (selector_shape(old)?, selector_shape(new)?);
    if old_shape != new_shape {
        return Err(invalid(format!(
            "backend selector cannot change from {:?} to {:?}",
            old_shape, new_shape
        )));
    }
    Ok(())
}

/// Validate a Bind
pub fn validate_bind(bind: &Bind) -> Result<()> {
    let spec = &bind.spec;
    if spec.load_balancers.is_empty() {
        return Err(invalid("loadBalancers must not be empty"));
    }
    let mut names = HashSet::new();
    for target in &spec.load_balancers {
        if target.name.is_empty() || target.driver.is_empty() {
            return Err(invalid("every load balancer needs a name and a driver"));
        }
        if !names.insert(target.name.as_str()) {
            return Err(invalid(format!("load balancer {} declared twice", target.name)));
        }
        validate_keys("attributes", &target.attributes)?;
    }

    validate_pod_selector(spec.pods.by_label.is_some(), spec.pods.by_name.as_deref())?;
    if spec.pods.ports.is_empty() {
        return Err(invalid("pods.ports must not be empty"));
    }
    for port in &spec.pods.ports {
        validate_port(port)?;
    }
    validate_keys("parameters", &spec.parameters)?;
    validate_ensure_policy(spec.ensure_policy.as_ref())
}

/// Validate a Bind update: a kept target may not change driver or spec
pub fn validate_bind_update(old: &Bind, new: &Bind) -> Result<()> {
    validate_bind(new)?;
    for target in &new.spec.load_balancers {
        let Some(previous) = old
            .spec
            .load_balancers
            .iter()
            .find(|t| t.name == target.name)
        else {
            continue;
        };
        if previous.driver != target.driver {
            return Err(invalid(format!("load balancer {}: driver is immutable", target.name)));
        }
        if previous.spec != target.spec {
            return Err(invalid(format!("load balancer {}: spec is immutable", target.name)));
        }
    }
    Ok(())
}

/// Ask the driver whether it accepts a LoadBalancer (validateLoadBalancer)
pub async fn validate_load_balancer_with_driver(
    client: &DriverClient,
    driver: &DriverRef,
    lb: &LoadBalancer,
    old: Option<&LoadBalancer>,
) -> Result<()> {
    let req = ValidateLoadBalancerRequest {
        lb_spec: lb.spec.lb_spec.clone(),
        operation: if old.is_some() {
            ValidateOperation::Update
        } else {
            ValidateOperation::Create
        },
        attributes: lb.spec.attributes.clone(),
        old_attributes: old.map(|o| o.spec.attributes.clone()),
    };
    let resp = client
        .validate_load_balancer(driver, &req)
        .await
        .map_err(|e| invalid(format!("driver {} could not validate: {}", driver.name, e)))?;
    if !resp.succ {
        return Err(invalid(format!("rejected by driver {}: {}", driver.name, resp.msg)));
    }
    Ok(())
}

/// Ask the driver whether it accepts a group's backend parameters (validateBackend)
pub async fn validate_backend_group_with_driver(
    client: &DriverClient,
    driver: &DriverRef,
    lb_info: &StringMap,
    group: &BackendGroup,
    old: Option<&BackendGroup>,
) -> Result<()> {
    let backend_type = match selector_shape(group)? {
        SelectorShape::PodsByLabel | SelectorShape::PodsByName => "Pod",
        SelectorShape::Service => "Service",
        SelectorShape::Static => "Static",
    };
    let req = ValidateBackendRequest {
        backend_type: backend_type.to_string(),
        lb_info: lb_info.clone(),
        operation: if old.is_some() {
            ValidateOperation::Update
        } else {
            ValidateOperation::Create
        },
        parameters: group.spec.parameters.clone(),
        old_parameters: old.map(|o| o.spec.parameters.clone()),
    };
    let resp = client
        .validate_backend(driver, &req)
        .await
        .map_err(|e| invalid(format!("driver {} could not validate: {}", driver.name, e)))?;
    if !resp.succ {
        return Err(invalid(format!("rejected by driver {}: {}", driver.name, resp.msg)));
    }
    Ok(())
}
