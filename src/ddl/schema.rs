// Schema (database) jobs
//
// Create: None -> Public in one step
// Drop:   Public -> WriteOnly -> DeleteOnly -> None

use crate::ddl::error::{DdlError, Result};
use crate::ddl::step::{Step, expect_state, mismatched_args, unexpected_state};
use crate::model::{DbInfo, Job, JobArgs, JobState, SchemaState};

/// `name_taken` is true when a schema with the same name already exists in
/// any state.
pub fn on_create_schema(name_taken: bool, job: &Job) -> Result<Step<DbInfo>> {
    let JobArgs::CreateSchema { name } = &job.args else {
        return Err(mismatched_args());
    };
    if job.schema_state != SchemaState::None {
        return Err(unexpected_state("create schema job", job.schema_state));
    }
    if name_taken {
        return Err(DdlError::SchemaExists(name.clone()));
    }
    let mut db = DbInfo::new(job.schema_id, name.clone());
    db.state = SchemaState::Public;
    Ok(Step::Finish { obj: Some(db), state: SchemaState::Public, job_state: JobState::Done })
}

/// `table_count` counts tables of the schema in any state
pub fn on_drop_schema(mut db: DbInfo, table_count: usize, job: &Job) -> Result<Step<DbInfo>> {
    if !matches!(job.args, JobArgs::DropSchema { .. }) {
        return Err(mismatched_args());
    }
    if job.state == JobState::Cancelling {
        expect_state("schema", db.state, SchemaState::WriteOnly)?;
        db.state = SchemaState::Public;
        return Ok(Step::Finish { obj: Some(db), state: SchemaState::Public, job_state: JobState::RollbackDone });
    }
    expect_state("schema", db.state, job.schema_state)?;

    match db.state {
        SchemaState::Public => {
            if table_count > 0 {
                return Err(DdlError::SchemaNotEmpty(db.name));
            }
            db.state = SchemaState::WriteOnly;
            Ok(Step::Advance { obj: db, state: SchemaState::WriteOnly })
        }
        SchemaState::WriteOnly => {
            db.state = SchemaState::DeleteOnly;
            Ok(Step::Advance { obj: db, state: SchemaState::DeleteOnly })
        }
        SchemaState::DeleteOnly => Ok(Step::Finish { obj: None, state: SchemaState::None, job_state: JobState::Done }),
        state => Err(unexpected_state("drop schema job", state)),
    }
}
