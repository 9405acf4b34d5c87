//! Outcome of one reconcile attempt

use std::time::Duration;

use crate::crd::EnsurePolicy;
use crate::driver::{OperationOutcome, TransportError};

/// What the work queue should do after a reconcile
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncResult {
    /// Nothing left to do until the next change event
    Finished,
    /// Retry with backoff; `retry_after` is a floor supplied by the driver
    Failed {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// A remote operation is still in flight; check again after the delay
    Running { recheck_after: Duration },
    /// Done for now, re-verify after the delay if still wanted
    Periodic { next_run: Duration },
}

impl SyncResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        SyncResult::Failed {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn failed_after(reason: impl Into<String>, retry_after: Duration) -> Self {
        SyncResult::Failed {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn running(recheck_after: Duration) -> Self {
        SyncResult::Running { recheck_after }
    }

    pub fn periodic(next_run: Duration) -> Self {
        SyncResult::Periodic { next_run }
    }

    /// Finished, or Periodic when the ensure policy asks for re-verification
    pub fn done(policy: Option<&EnsurePolicy>) -> Self {
        match policy.and_then(EnsurePolicy::resync_period) {
            Some(period) => SyncResult::Periodic { next_run: period },
            None => SyncResult::Finished,
        }
    }

    /// Map a non-Succ driver outcome; Succ maps to Finished
    pub fn from_outcome(outcome: &OperationOutcome) -> Self {
        match outcome {
            OperationOutcome::Succ => SyncResult::Finished,
            OperationOutcome::Fail { msg, retry_after } => {
                SyncResult::failed_after(msg.clone(), *retry_after)
            }
            OperationOutcome::Running { retry_after, .. } => SyncResult::running(*retry_after),
        }
    }

    /// Transport errors use the queue's default backoff
    pub fn from_transport(err: &TransportError) -> Self {
        SyncResult::failed(err.to_string())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SyncResult::Finished)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncResult::Failed { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SyncResult::Running { .. })
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, SyncResult::Periodic { .. })
    }

    /// Label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SyncResult::Finished => "finished",
            SyncResult::Failed { .. } => "failed",
            SyncResult::Running { .. } => "running",
            SyncResult::Periodic { .. } => "periodic",
        }
    }

    /// Combine the results of independent sub-operations
    ///
    /// Failed wins over Running, Running over Periodic, Periodic over Finished.
    /// Delays are combined by taking the shortest one.
    pub fn merge(self, other: SyncResult) -> SyncResult {
        use SyncResult::*;
        match (self, other) {
            (
                Failed {
                    reason,
                    retry_after: a,
                },
                Failed { retry_after: b, .. },
            ) => Failed {
                reason,
                retry_after: min_opt(a, b),
            },
            (f @ Failed { .. }, _) | (_, f @ Failed { .. }) => f,
            (Running { recheck_after: a }, Running { recheck_after: b }) => Running {
                recheck_after: a.min(b),
            },
            (r @ Running { .. }, _) | (_, r @ Running { .. }) => r,
            (Periodic { next_run: a }, Periodic { next_run: b }) => Periodic {
                next_run: a.min(b),
            },
            (p @ Periodic { .. }, _) | (_, p @ Periodic { .. }) => p,
            (Finished, Finished) => Finished,
        }
    }
}

fn min_opt(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
