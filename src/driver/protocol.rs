//! Wire types of the driver webhook protocol
//!
//! Every operation is a `POST {driverUrl}/{operationName}` with a JSON body.
//! Validating operations answer `{succ, msg}`; action operations answer
//! `{status, msg, retryIntervalInSeconds}` where status is Succ, Fail or Running.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crd::StringMap;

/// Timeout applied when a driver does not declare one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry interval applied when a driver does not suggest a positive one
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Closed set of webhook operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    ValidateLoadBalancer,
    CreateLoadBalancer,
    EnsureLoadBalancer,
    DeleteLoadBalancer,
    ValidateBackend,
    GenerateBackendAddr,
    EnsureBackend,
    DeregisterBackend,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::ValidateLoadBalancer,
        Operation::CreateLoadBalancer,
        Operation::EnsureLoadBalancer,
        Operation::DeleteLoadBalancer,
        Operation::ValidateBackend,
        Operation::GenerateBackendAddr,
        Operation::EnsureBackend,
        Operation::DeregisterBackend,
    ];

    /// Name used as the last path segment of the webhook URL
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ValidateLoadBalancer => "validateLoadBalancer",
            Operation::CreateLoadBalancer => "createLoadBalancer",
            Operation::EnsureLoadBalancer => "ensureLoadBalancer",
            Operation::DeleteLoadBalancer => "deleteLoadBalancer",
            Operation::ValidateBackend => "validateBackend",
            Operation::GenerateBackendAddr => "generateBackendAddr",
            Operation::EnsureBackend => "ensureBackend",
            Operation::DeregisterBackend => "deregisterBackend",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Validating operations answer `{succ, msg}` and must be fast
    pub fn is_validating(&self) -> bool {
        matches!(
            self,
            Operation::ValidateLoadBalancer | Operation::ValidateBackend
        )
    }

    /// Admissible range for a driver-declared timeout
    pub fn timeout_bounds(&self) -> (Duration, Duration) {
        if self.is_validating() {
            (Duration::from_secs(5), Duration::from_secs(60))
        } else {
            (Duration::from_secs(5), Duration::from_secs(600))
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifiers sent with every action request
///
/// `recordID` is stable for one logical operation; `retryID` is fresh for
/// every attempt so drivers can deduplicate retries.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RetryIds {
    #[serde(rename = "recordID")]
    pub record_id: String,
    #[serde(rename = "retryID")]
    pub retry_id: String,
}

impl RetryIds {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            retry_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Whether a validation concerns a new object or a change
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidateOperation {
    Create,
    Update,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ValidateLoadBalancerRequest {
    pub lb_spec: StringMap,
    pub operation: ValidateOperation,
    pub attributes: StringMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_attributes: Option<StringMap>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancerRequest {
    #[serde(flatten)]
    pub ids: RetryIds,
    pub lb_spec: StringMap,
    pub attributes: StringMap,
}

/// Body of ensureLoadBalancer and deleteLoadBalancer
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerRequest {
    #[serde(flatten)]
    pub ids: RetryIds,
    pub lb_info: StringMap,
    pub attributes: StringMap,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ValidateBackendRequest {
    pub backend_type: String,
    pub lb_info: StringMap,
    pub operation: ValidateOperation,
    pub parameters: StringMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_parameters: Option<StringMap>,
}

/// Concrete backend handed to generateBackendAddr
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub enum GenerateTarget {
    /// Full pod object as read from the cluster
    Pod(serde_json::Value),
    /// Service and node objects plus the selected port
    Service {
        service: serde_json::Value,
        node: serde_json::Value,
        port: i32,
        protocol: String,
    },
    Static(String),
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBackendAddrRequest {
    #[serde(flatten)]
    pub ids: RetryIds,
    pub lb_info: StringMap,
    pub lb_attributes: StringMap,
    #[serde(flatten)]
    pub target: GenerateTarget,
}

/// Body of ensureBackend and deregisterBackend
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BackendRequest {
    #[serde(flatten)]
    pub ids: RetryIds,
    pub backend_addr: String,
    pub lb_info: StringMap,
    pub lb_attributes: StringMap,
    pub parameters: StringMap,
}

/// Response of a validating operation
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ValidateResponse {
    pub succ: bool,
    #[serde(default)]
    pub msg: String,
}

/// Status reported by an action operation
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Succ,
    Fail,
    Running,
}

/// Response of an action operation
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub status: ActionStatus,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub retry_interval_in_seconds: i64,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancerResponse {
    #[serde(flatten)]
    pub action: ActionResponse,
    #[serde(default)]
    pub lb_info: StringMap,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBackendAddrResponse {
    #[serde(flatten)]
    pub action: ActionResponse,
    #[serde(default)]
    pub backend_addr: String,
}

/// Classified result of an action operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationOutcome {
    Succ,
    Fail { msg: String, retry_after: Duration },
    Running { msg: String, retry_after: Duration },
}

impl OperationOutcome {
    pub fn is_succ(&self) -> bool {
        matches!(self, OperationOutcome::Succ)
    }
}

impl From<&ActionResponse> for OperationOutcome {
    fn from(resp: &ActionResponse) -> Self {
        let retry_after = resolve_retry_interval(resp.retry_interval_in_seconds);
        match resp.status {
            ActionStatus::Succ => OperationOutcome::Succ,
            ActionStatus::Fail => OperationOutcome::Fail {
                msg: resp.msg.clone(),
                retry_after,
            },
            ActionStatus::Running => OperationOutcome::Running {
                msg: resp.msg.clone(),
                retry_after,
            },
        }
    }
}

/// Use the driver's suggestion when positive, the default otherwise
pub fn resolve_retry_interval(suggested_secs: i64) -> Duration {
    if suggested_secs > 0 {
        Duration::from_secs(suggested_secs as u64)
    } else {
        DEFAULT_RETRY_INTERVAL
    }
}
