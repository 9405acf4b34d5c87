//! Per-kind [`Reconciler`] implementations fed by the work queues

use std::sync::Arc;

use async_trait::async_trait;

use crate::controller::error::Result;
use crate::controller::sync_result::SyncResult;
use crate::controller::{
    Context, reconcile_backend_group, reconcile_backend_record, reconcile_bind,
    reconcile_load_balancer,
};
use crate::crd::wants_periodic;
use crate::queue::{ObjectKey, Reconciler};
use crate::store::is_deleting;

pub struct LoadBalancerReconciler {
    pub ctx: Arc<Context>,
}

#[async_trait]
impl Reconciler for LoadBalancerReconciler {
    fn kind(&self) -> &'static str {
        "LoadBalancer"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncResult> {
        reconcile_load_balancer(&self.ctx, &key.namespace, &key.name).await
    }

    fn wants_resync(&self, key: &ObjectKey) -> bool {
        self.ctx
            .load_balancers
            .cached(&key.namespace, &key.name)
            .is_some_and(|lb| !is_deleting(lb.as_ref()) && wants_periodic(lb.spec.ensure_policy.as_ref()))
    }
}

pub struct BackendGroupReconciler {
    pub ctx: Arc<Context>,
}

#[async_trait]
impl Reconciler for BackendGroupReconciler {
    fn kind(&self) -> &'static str {
        "BackendGroup"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncResult> {
        reconcile_backend_group(&self.ctx, &key.namespace, &key.name).await
    }

    // groups talk to no driver; their records carry the ensure policy
    fn wants_resync(&self, _key: &ObjectKey) -> bool {
        false
    }
}

pub struct BackendRecordReconciler {
    pub ctx: Arc<Context>,
}

#[async_trait]
impl Reconciler for BackendRecordReconciler {
    fn kind(&self) -> &'static str {
        "BackendRecord"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncResult> {
        reconcile_backend_record(&self.ctx, &key.namespace, &key.name).await
    }

    fn wants_resync(&self, key: &ObjectKey) -> bool {
        self.ctx
            .backend_records
            .cached(&key.namespace, &key.name)
            .is_some_and(|r| !is_deleting(r.as_ref()) && wants_periodic(r.spec.ensure_policy.as_ref()))
    }
}

pub struct BindReconciler {
    pub ctx: Arc<Context>,
}

#[async_trait]
impl Reconciler for BindReconciler {
    fn kind(&self) -> &'static str {
        "Bind"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncResult> {
        reconcile_bind(&self.ctx, &key.namespace, &key.name).await
    }

    fn wants_resync(&self, key: &ObjectKey) -> bool {
        self.ctx
            .binds
            .cached(&key.namespace, &key.name)
            .is_some_and(|b| !is_deleting(b.as_ref()) && wants_periodic(b.spec.ensure_policy.as_ref()))
    }
}
