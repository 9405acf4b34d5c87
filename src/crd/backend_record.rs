//! BackendRecord CRD definition
//!
//! A BackendRecord is one (load balancer, backend, port) attachment. Records are
//! created and deleted by BackendGroup and Bind reconcilers, never by users.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backend_group::PortSelector;
use super::common::{Condition, EnsurePolicy, StringMap};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "lbcf.example.com",
    version = "v1beta1",
    kind = "BackendRecord",
    plural = "backendrecords",
    shortname = "br",
    namespaced,
    status = "BackendRecordStatus",
    printcolumn = r#"{"name":"LB", "type":"string", "jsonPath":".spec.lbName"}"#,
    printcolumn = r#"{"name":"Addr", "type":"string", "jsonPath":".status.backendAddr"}"#,
    printcolumn = r#"{"name":"Registered", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Registered\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackendRecordSpec {
    /// Load balancer name (LoadBalancer object or Bind target)
    pub lb_name: String,

    /// Name of the LoadBalancerDriver
    pub lb_driver: String,

    /// Snapshot of the load balancer's driver handle
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub lb_info: StringMap,

    /// Snapshot of the load balancer's attributes
    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub lb_attributes: StringMap,

    /// The concrete backend
    pub backend: BackendDescriptor,

    #[serde(default, skip_serializing_if = "StringMap::is_empty")]
    pub parameters: StringMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_policy: Option<EnsurePolicy>,
}

/// The backend a record attaches
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackendDescriptor {
    /// A pod port
    Pod { name: String, port: PortSelector },
    /// A service node port on one node
    Service {
        name: String,
        #[serde(rename = "nodeName")]
        node_name: String,
        port: PortSelector,
    },
    /// A static address
    Static { addr: String },
}

impl BackendDescriptor {
    /// Short kind name, used in driver requests and logs
    pub fn kind(&self) -> &'static str {
        match self {
            BackendDescriptor::Pod { .. } => "Pod",
            BackendDescriptor::Service { .. } => "Service",
            BackendDescriptor::Static { .. } => "Static",
        }
    }

    /// Key identifying the selected object, independent of port
    pub fn selector_key(&self) -> String {
        match self {
            BackendDescriptor::Pod { name, .. } => format!("pod/{}", name),
            BackendDescriptor::Service {
                name, node_name, ..
            } => format!("service/{}/node/{}", name, node_name),
            BackendDescriptor::Static { addr } => format!("static/{}", addr),
        }
    }

    pub fn port(&self) -> Option<&PortSelector> {
        match self {
            BackendDescriptor::Pod { port, .. } | BackendDescriptor::Service { port, .. } => {
                Some(port)
            }
            BackendDescriptor::Static { .. } => None,
        }
    }
}

/// Status of a BackendRecord
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendRecordStatus {
    /// Address generated by the driver, empty until generateBackendAddr succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_addr: Option<String>,

    /// AddrGenerated and Registered conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation whose spec was last registered successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl BackendRecord {
    /// The generated backend address, if any
    pub fn backend_addr(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.backend_addr.as_deref())
            .filter(|a| !a.is_empty())
    }
}
