//! Worker pool driving one reconciler from its work queue

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::WorkQueue;
use crate::controller::error::Result;
use crate::controller::sync_result::SyncResult;
use crate::telemetry::Telemetry;

/// Namespace and name of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A reconcile function for one resource type
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Resource kind, used in logs and metrics
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> Result<SyncResult>;

    /// Whether a scheduled periodic re-run is still wanted
    ///
    /// Evaluated against the freshest cached copy when the key is popped; an
    /// object that disappeared or stopped asking for re-verification returns
    /// false.
    fn wants_resync(&self, key: &ObjectKey) -> bool;
}

/// Schedule the next run of a key from the result of its reconcile
pub fn schedule_next<R: Reconciler + ?Sized>(
    queue: &Arc<WorkQueue<ObjectKey>>,
    reconciler: &Arc<R>,
    key: &ObjectKey,
    result: &SyncResult,
) {
    match result {
        SyncResult::Finished => queue.forget(key),
        SyncResult::Failed {
            reason,
            retry_after,
        } => {
            let delay = queue.enqueue_rate_limited(key.clone(), *retry_after);
            warn!(kind = reconciler.kind(), key = %key, reason = %reason, ?delay, "Reconcile failed, requeueing");
        }
        SyncResult::Running { recheck_after } => {
            queue.forget(key);
            queue.enqueue_after(key.clone(), *recheck_after);
        }
        SyncResult::Periodic { next_run } => {
            queue.forget(key);
            let reconciler = reconciler.clone();
            queue.enqueue_filtered(
                key.clone(),
                *next_run,
                Arc::new(move |k: &ObjectKey| reconciler.wants_resync(k)),
            );
        }
    }
}

/// Run `workers` concurrent workers until the queue shuts down
pub async fn run_workers<R: Reconciler>(
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<R>,
    workers: usize,
    telemetry: Arc<dyn Telemetry>,
) {
    info!(kind = reconciler.kind(), workers, "Starting workers");
    let pool = (0..workers.max(1)).map(|id| {
        let queue = queue.clone();
        let reconciler = reconciler.clone();
        let telemetry = telemetry.clone();
        async move {
            while let Some(key) = queue.pop().await {
                let started = Instant::now();
                match reconciler.reconcile(&key).await {
                    Ok(result) => {
                        telemetry.reconciled(
                            reconciler.kind(),
                            result.kind(),
                            started.elapsed().as_secs_f64(),
                        );
                        debug!(kind = reconciler.kind(), worker = id, key = %key, result = result.kind(), "Reconciled");
                        schedule_next(&queue, &reconciler, &key, &result);
                    }
                    Err(e) if e.is_retryable() => {
                        let result = SyncResult::failed(e.to_string());
                        telemetry.reconciled(
                            reconciler.kind(),
                            result.kind(),
                            started.elapsed().as_secs_f64(),
                        );
                        schedule_next(&queue, &reconciler, &key, &result);
                    }
                    Err(e) => {
                        // retrying cannot help; the next watch event for the key runs it again
                        telemetry.reconciled(
                            reconciler.kind(),
                            "failed",
                            started.elapsed().as_secs_f64(),
                        );
                        warn!(kind = reconciler.kind(), key = %key, error = %e, "Reconcile failed permanently, not requeueing");
                        queue.forget(&key);
                    }
                }
                queue.done(&key);
            }
        }
    });
    join_all(pool).await;
    info!(kind = reconciler.kind(), "Workers stopped");
}
