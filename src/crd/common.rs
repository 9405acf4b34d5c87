//! Types shared by every LBCF custom resource

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group for all LBCF resources
pub const API_GROUP: &str = "lbcf.example.com";

/// Label carrying the load balancer a BackendRecord belongs to
pub const LABEL_LB_NAME: &str = "lbcf.example.com/lb-name";

/// Label carrying the BackendGroup that owns a BackendRecord
pub const LABEL_BACKEND_GROUP: &str = "lbcf.example.com/backend-group";

/// Label carrying the Bind that owns a BackendRecord
pub const LABEL_BIND: &str = "lbcf.example.com/bind";

/// Finalizer blocking removal of a LoadBalancer or Bind until the driver deleted it
pub const FINALIZER_DELETE_LB: &str = "lbcf.example.com/delete-lb";

/// Finalizer blocking removal of a BackendRecord until the backend is deregistered
pub const FINALIZER_DEREGISTER: &str = "lbcf.example.com/deregister";

/// Minimum resync period accepted for `EnsurePolicy::Always`
pub const MIN_RESYNC_PERIOD_SECS: i64 = 30;

/// Free-form string map used for driver specs, attributes, parameters and LB info
pub type StringMap = BTreeMap<String, String>;

/// Status of a condition
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style status condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: ConditionStatus,

    /// Last time the condition was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Machine-readable reason for the last write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// How often a resource is re-verified against its driver
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum EnsurePolicyType {
    /// Call ensure until the first success, then stop
    #[default]
    IfNotSucc,
    /// Call ensure periodically, every `resyncPeriodInSeconds`
    Always,
}

/// Ensure policy of a LoadBalancer, BackendGroup, Bind or BackendRecord
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnsurePolicy {
    #[serde(default)]
    pub policy: EnsurePolicyType,

    /// Period between two ensure calls when policy is `Always`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_period_in_seconds: Option<i64>,
}

impl EnsurePolicy {
    pub fn always(period_secs: i64) -> Self {
        Self {
            policy: EnsurePolicyType::Always,
            resync_period_in_seconds: Some(period_secs),
        }
    }

    /// Whether this policy asks for periodic re-verification
    pub fn is_always(&self) -> bool {
        self.policy == EnsurePolicyType::Always
    }

    /// Delay until the next periodic ensure, clamped to the minimum period
    pub fn resync_period(&self) -> Option<std::time::Duration> {
        if !self.is_always() {
            return None;
        }
        let secs = self
            .resync_period_in_seconds
            .unwrap_or(MIN_RESYNC_PERIOD_SECS)
            .max(MIN_RESYNC_PERIOD_SECS);
        Some(std::time::Duration::from_secs(secs as u64))
    }
}

/// Helper shared by optional ensure policies on specs
pub fn wants_periodic(policy: Option<&EnsurePolicy>) -> bool {
    policy.is_some_and(EnsurePolicy::is_always)
}
