//! LoadBalancer CRD definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{Condition, EnsurePolicy, StringMap};

/// LoadBalancer declares one external load balancer managed through a driver
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "lbcf.example.com",
    version = "v1beta1",
    kind = "LoadBalancer",
    plural = "loadbalancers",
    shortname = "lb",
    namespaced,
    status = "LoadBalancerStatus",
    printcolumn = r#"{"name":"Driver", "type":"string", "jsonPath":".spec.lbDriver"}"#,
    printcolumn = r#"{"name":"Created", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Created\")].status"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Name of the LoadBalancerDriver in the same namespace
    pub lb_driver: String,

    /// Driver-specific description of the load balancer
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub lb_spec: StringMap,

    /// Mutable attributes synced with ensureLoadBalancer
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub attributes: StringMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicy>,
}

/// Status of a load balancer, shared by LoadBalancer and each Bind target
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Created and Ready conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Handle returned by the driver on creation
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub lb_info: StringMap,

    /// Attributes sent with the last successful ensure
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub last_synced_attributes: StringMap,

    /// Earliest time the last failed operation should be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
}
