// Table jobs
//
// Create: None -> Public in one step
// Drop:   Public -> WriteOnly -> DeleteOnly -> DeleteReorganization -> None
//
// The last drop step deletes every key under the table prefix before the
// descriptor goes away.

use std::collections::HashSet;

use crate::ddl::column::check_default;
use crate::ddl::error::{DdlError, Result};
use crate::ddl::reorg::ReorgTask;
use crate::ddl::step::{Step, expect_state, mismatched_args, unexpected_state};
use crate::evaluator::Evaluator;
use crate::model::{DbInfo, Job, JobArgs, JobState, SchemaState, TableInfo};

/// `db` is the owning schema if it exists; `name_taken` is true when the
/// schema already holds a table with the same name in any state.
pub fn on_create_table(
    db: Option<&DbInfo>,
    name_taken: bool,
    job: &Job,
    evaluator: &dyn Evaluator,
) -> Result<Step<TableInfo>> {
    let JobArgs::CreateTable { table } = &job.args else {
        return Err(mismatched_args());
    };
    if job.schema_state != SchemaState::None {
        return Err(unexpected_state("create table job", job.schema_state));
    }
    match db {
        Some(db) if db.state == SchemaState::Public => {}
        _ => return Err(DdlError::SchemaNotFound(job.schema_id.to_string())),
    }
    if name_taken {
        return Err(DdlError::TableExists(table.name.clone()));
    }
    if table.columns.is_empty() {
        return Err(DdlError::InvalidDefinition(format!("table '{}' has no columns", table.name)));
    }
    let mut names = HashSet::new();
    for col in &table.columns {
        if !names.insert(col.name.to_lowercase()) {
            return Err(DdlError::ColumnExists(col.name.clone()));
        }
        check_default(col, evaluator, false)?;
    }

    let mut info = table.clone();
    info.id = job.table_id;
    info.schema_id = job.schema_id;
    info.state = SchemaState::Public;
    for col in &mut info.columns {
        col.state = SchemaState::Public;
    }
    for index in &mut info.indices {
        index.state = SchemaState::Public;
    }
    Ok(Step::Finish { obj: Some(info), state: SchemaState::Public, job_state: JobState::Done })
}

pub fn on_drop_table(mut table: TableInfo, job: &Job) -> Result<Step<TableInfo>> {
    if !matches!(job.args, JobArgs::DropTable { .. }) {
        return Err(mismatched_args());
    }
    if job.state == JobState::Cancelling {
        expect_state("table", table.state, SchemaState::WriteOnly)?;
        table.state = SchemaState::Public;
        return Ok(Step::Finish { obj: Some(table), state: SchemaState::Public, job_state: JobState::RollbackDone });
    }
    expect_state("table", table.state, job.schema_state)?;

    if let Some(next) = table.state.next_removal_state() {
        table.state = next;
        return Ok(Step::Advance { obj: table, state: next });
    }
    if table.state != SchemaState::DeleteReorganization {
        return Err(unexpected_state("drop table job", table.state));
    }
    if !job.reorg_done {
        return Ok(Step::Reorganize(ReorgTask::DropTable { table_id: table.id }));
    }
    Ok(Step::Finish { obj: None, state: SchemaState::None, job_state: JobState::Done })
}
