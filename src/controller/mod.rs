pub mod backend_group;
pub mod backend_record;
pub mod backends;
pub mod bind;
pub mod conditions;
pub mod context;
pub mod diff;
pub mod error;
pub mod events;
pub mod load_balancer;
pub mod naming;
pub mod runner;
pub mod sync_result;
pub mod triggers;
pub mod validation;

pub use backend_group::reconcile_backend_group;
pub use backend_record::reconcile_backend_record;
pub use bind::reconcile_bind;
pub use context::Context;
pub use diff::BackendDiff;
pub use error::{BackoffConfig, Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use load_balancer::{reconcile_load_balancer, sync_target};
pub use naming::{OwnerKind, backend_record_name};
pub use runner::{
    BackendGroupReconciler, BackendRecordReconciler, BindReconciler, LoadBalancerReconciler,
};
pub use sync_result::SyncResult;
