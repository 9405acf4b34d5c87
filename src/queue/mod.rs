//! Work queues and the workers that drain them

mod work_queue;
mod workers;

pub use work_queue::{Predicate, WorkQueue};
pub use workers::{ObjectKey, Reconciler, run_workers, schedule_next};
