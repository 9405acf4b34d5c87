//! BackendGroup CRD definition
//!
//! A BackendGroup selects backends (pods, a service's node ports, or static
//! addresses) and attaches all of them to one or more LoadBalancers.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{EnsurePolicy, StringMap};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "lbcf.example.com",
    version = "v1beta1",
    kind = "BackendGroup",
    plural = "backendgroups",
    shortname = "bg",
    namespaced,
    status = "BackendGroupStatus",
    printcolumn = r#"{"name":"Backends", "type":"integer", "jsonPath":".status.backends"}"#,
    printcolumn = r#"{"name":"Registered", "type":"integer", "jsonPath":".status.registeredBackends"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackendGroupSpec {
    /// Names of LoadBalancers in the same namespace
    pub load_balancers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<PodBackend>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceBackend>,

    /// Static backend addresses, passed to the driver verbatim
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_addrs: Option<Vec<String>>,

    /// Driver-specific backend parameters (weight, etc.)
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub parameters: StringMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicy>,
}

/// Port of a backend
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PortSelector {
    pub port_number: i32,

    #[serde(default = "default_protocol")]
    pub protocol: String,
}

pub fn default_protocol() -> String {
    "TCP".to_string()
}

impl PortSelector {
    pub fn tcp(port_number: i32) -> Self {
        Self {
            port_number,
            protocol: default_protocol(),
        }
    }
}

impl std::fmt::Display for PortSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port_number, self.protocol)
    }
}

/// Pods selected either by label or by name
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodBackend {
    pub port: PortSelector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_label: Option<SelectPodByLabel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_name: Option<Vec<String>>,
}

/// Label selector with an exclusion list of pod names
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectPodByLabel {
    pub selector: StringMap,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub except: Vec<String>,
}

/// A service's node ports on every node matching `nodeSelector`
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBackend {
    pub name: String,

    pub port: PortSelector,

    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub node_selector: StringMap,
}

/// Status of a BackendGroup
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendGroupStatus {
    /// Number of BackendRecords owned by the group
    #[serde(default)]
    pub backends: i32,

    /// Number of those records currently registered
    #[serde(default)]
    pub registered_backends: i32,
}
