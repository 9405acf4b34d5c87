//! Bind CRD definition
//!
//! A Bind declares a set of target load balancers together with the pods that
//! must be attached to every one of them. Each target runs its own load
//! balancer lifecycle; their statuses are kept in one list keyed by name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backend_group::{PortSelector, SelectPodByLabel};
use super::common::{EnsurePolicy, StringMap};
use super::load_balancer::LoadBalancerStatus;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "lbcf.example.com",
    version = "v1beta1",
    kind = "Bind",
    plural = "binds",
    namespaced,
    status = "BindStatus",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BindSpec {
    /// Target load balancers, unique by name
    pub load_balancers: Vec<TargetLoadBalancer>,

    pub pods: BindPods,

    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub parameters: StringMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicy>,
}

/// One load balancer targeted by a Bind
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetLoadBalancer {
    pub name: String,

    /// Name of the LoadBalancerDriver
    pub driver: String,

    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub spec: StringMap,

    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub attributes: StringMap,
}

/// Pods attached by a Bind, on every listed port
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindPods {
    pub ports: Vec<PortSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_label: Option<SelectPodByLabel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_name: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_statuses: Vec<TargetLoadBalancerStatus>,
}

/// Status of one Bind target
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetLoadBalancerStatus {
    pub name: String,

    pub driver: String,

    /// Spec the load balancer was created with
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub spec: StringMap,

    /// Set once the target is removed from the spec or the Bind is deleted
    #[serde(default)]
    pub deleting: bool,

    #[serde(flatten)]
    pub state: LoadBalancerStatus,
}

impl BindStatus {
    pub fn target(&self, name: &str) -> Option<&TargetLoadBalancerStatus> {
        self.load_balancer_statuses.iter().find(|s| s.name == name)
    }
}
