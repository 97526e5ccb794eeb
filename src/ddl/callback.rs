// Observer hooks for DDL progress. Nothing in the engine depends on a
// callback being installed; they exist for monitoring and tests.

use crate::model::{Job, SchemaState};

pub trait Callback: Send + Sync {
    /// A job change was committed and its schema version published. `job`
    /// carries the new state and error, `old_state` the state before.
    fn on_job_updated(&self, _job: &Job, _old_state: SchemaState) {}

    /// The owner is about to run one step of `job`
    fn on_job_run_before(&self, _job: &Job) {}

    /// A backfill batch of `range` committed, `processed` keys so far
    fn on_reorg_batch(&self, _job: &Job, _range: usize, _processed: u64) {}
}

/// Callback that ignores everything
#[derive(Debug, Default)]
pub struct NoopCallback;

impl Callback for NoopCallback {}
