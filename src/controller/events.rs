//! Kubernetes Event recording for the LBCF controllers
//!
//! Events are fire-and-forget: a failed publish is logged and never fails the
//! reconcile that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event produced by a reconcile step, published by the caller
#[derive(Clone, Debug)]
pub struct LifecycleEvent {
    pub type_: EventType,
    pub reason: &'static str,
    pub action: &'static str,
    pub note: String,
}

impl LifecycleEvent {
    pub fn warning(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            action,
            note: note.into(),
        }
    }

    pub fn normal(reason: &'static str, action: &'static str, note: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            action,
            note: note.into(),
        }
    }
}

/// Event reasons, shown under REASON by `kubectl get events`
pub mod reasons {
    /// A driver answered Fail
    pub const DRIVER_FAILED: &str = "DriverFailed";
    /// A webhook call could not be completed
    pub const WEBHOOK_ERROR: &str = "WebhookError";
    /// A load balancer was created by its driver
    pub const LOAD_BALANCER_CREATED: &str = "LoadBalancerCreated";
    /// A load balancer was deleted by its driver
    pub const LOAD_BALANCER_DELETED: &str = "LoadBalancerDeleted";
    /// A backend was registered
    pub const BACKEND_REGISTERED: &str = "BackendRegistered";
    /// A backend was deregistered
    pub const BACKEND_DEREGISTERED: &str = "BackendDeregistered";
}

/// Event actions, shown under ACTION
pub mod actions {
    pub const CREATE: &str = "Create";
    pub const ENSURE: &str = "Ensure";
    pub const DELETE: &str = "Delete";
    pub const GENERATE_ADDR: &str = "GenerateAddr";
    pub const REGISTER: &str = "Register";
    pub const DEREGISTER: &str = "Deregister";
}
