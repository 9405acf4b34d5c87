//! LoadBalancerDriver CRD definition
//!
//! A driver is an external HTTP service implementing the LBCF webhook protocol
//! for one load balancer technology. The operator only needs its base URL and
//! optional per-operation timeouts.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "lbcf.example.com",
    version = "v1beta1",
    kind = "LoadBalancerDriver",
    plural = "loadbalancerdrivers",
    shortname = "lbdriver",
    namespaced,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDriverSpec {
    /// Driver type, only "Webhook" is supported
    #[serde(default = "default_driver_type")]
    pub driver_type: String,

    /// Base URL of the driver, e.g. `http://my-driver.kube-system.svc`
    pub url: String,

    /// Per-operation webhook settings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<WebhookConfig>,
}

fn default_driver_type() -> String {
    "Webhook".to_string()
}

/// Settings for a single webhook operation
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Operation name, e.g. `createLoadBalancer`
    pub name: String,

    /// Timeout as a duration string (`500ms`, `10s`, `2m`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}
