use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::Resource;

use crate::controller::error::{Error, Result};
use crate::controller::events::{EventPublisher, LifecycleEvent};
use crate::crd::{BackendGroup, BackendRecord, Bind, LoadBalancer, LoadBalancerDriver};
use crate::driver::{DriverClient, DriverRef};
use crate::store::{Cache, DEFAULT_CONFLICT_RETRIES, Store};

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    pub load_balancers: Store<LoadBalancer>,
    pub backend_groups: Store<BackendGroup>,
    pub backend_records: Store<BackendRecord>,
    pub binds: Store<Bind>,
    pub drivers: Cache<LoadBalancerDriver>,
    pub pods: Cache<Pod>,
    pub services: Cache<Service>,
    pub nodes: Cache<Node>,
    pub driver_client: DriverClient,
    pub events: Arc<dyn EventPublisher>,
    /// Namespace searched for drivers not found in the object's own namespace
    pub system_namespace: String,
    /// Bound on re-read-and-reapply loops for conflicting writes
    pub conflict_retries: u32,
}

impl Context {
    /// Resolve a driver by name, first in `namespace`, then in the system namespace
    pub fn driver_ref(&self, namespace: &str, name: &str) -> Result<DriverRef> {
        self.drivers
            .cached(namespace, name)
            .or_else(|| self.drivers.cached(&self.system_namespace, name))
            .map(|driver| DriverRef::from_driver(&driver))
            .ok_or_else(|| Error::NotFound(format!("LoadBalancerDriver {}/{}", namespace, name)))
    }

    pub fn conflict_retries(&self) -> u32 {
        if self.conflict_retries == 0 {
            DEFAULT_CONFLICT_RETRIES
        } else {
            self.conflict_retries
        }
    }

    /// Publish an event on an object
    pub async fn publish_event<K>(&self, obj: &K, event: &LifecycleEvent)
    where
        K: Resource<DynamicType = ()>,
    {
        self.events
            .publish(
                &obj.object_ref(&()),
                event.type_.clone(),
                event.reason,
                event.action,
                Some(event.note.clone()),
            )
            .await;
    }
}
