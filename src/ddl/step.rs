// Result of one state-machine step
//
// Handlers are pure: given the current object and the job they return what
// should be persisted next. The worker applies the step inside the owner
// transaction, so running a handler twice against the same persisted state
// yields the same step.

use crate::ddl::error::{DdlError, Result};
use crate::ddl::reorg::ReorgTask;
use crate::model::{JobState, SchemaState};

#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    /// Persist `obj`; the job's target is now in `state`
    Advance { obj: T, state: SchemaState },
    /// Backfill has to run before the job can leave its current state
    Reorganize(ReorgTask),
    /// Persist `obj`, or remove the object when `None`, and end the job
    Finish { obj: Option<T>, state: SchemaState, job_state: JobState },
}

/// Guard against a job whose recorded state disagrees with its object
pub(crate) fn expect_state(what: &str, actual: SchemaState, expected: SchemaState) -> Result<()> {
    if actual != expected {
        return Err(DdlError::Internal(format!(
            "{} is in state {} but the job expects {}",
            what, actual, expected
        )));
    }
    Ok(())
}

pub(crate) fn unexpected_state(what: &str, state: SchemaState) -> DdlError {
    DdlError::Internal(format!("{} cannot advance from state {}", what, state))
}

pub(crate) fn mismatched_args() -> DdlError {
    DdlError::Internal("job arguments do not match the job type".to_string())
}
