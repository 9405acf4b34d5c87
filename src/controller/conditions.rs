//! Condition list helpers
//!
//! Conditions are keyed by type: setting a condition whose type is already
//! present overwrites that entry in place, otherwise the condition is appended.

use chrono::Utc;

use crate::crd::{Condition, ConditionStatus};

/// Condition types written by the reconcilers
pub mod condition_types {
    /// LoadBalancer: the driver created the load balancer
    pub const CREATED: &str = "Created";
    /// LoadBalancer: the last ensure succeeded
    pub const READY: &str = "Ready";
    /// BackendRecord: the driver generated a backend address
    pub const ADDR_GENERATED: &str = "AddrGenerated";
    /// BackendRecord: the backend is registered behind the load balancer
    pub const REGISTERED: &str = "Registered";
}

/// Condition reasons
pub mod reasons {
    pub const SUCCEEDED: &str = "Succeeded";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const CREATE_FAILED: &str = "CreateFailed";
    pub const ENSURE_FAILED: &str = "EnsureFailed";
    pub const DELETE_FAILED: &str = "DeleteFailed";
    pub const GENERATE_ADDR_FAILED: &str = "GenerateAddrFailed";
    pub const REGISTER_FAILED: &str = "RegisterFailed";
    pub const DEREGISTER_FAILED: &str = "DeregisterFailed";
    pub const DELAYED_ENSURE: &str = "DelayedEnsure";
}

/// A condition stamped with the current time
pub fn new_condition(
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> Condition {
    let message = message.into();
    Condition {
        type_: type_.to_string(),
        status,
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message).filter(|m| !m.is_empty()),
    }
}

/// Add or overwrite a condition by type
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn condition_status(conditions: &[Condition], type_: &str) -> Option<ConditionStatus> {
    find_condition(conditions, type_).map(|c| c.status)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    condition_status(conditions, type_) == Some(ConditionStatus::True)
}

/// Whether a condition of this type has been written at all
pub fn has_condition(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some()
}
