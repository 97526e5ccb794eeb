// Index state machine. Same states as columns; the reorganization steps
// build or remove index entries instead of column values.

use std::collections::HashSet;

use crate::ddl::column::check_table_public;
use crate::ddl::error::{DdlError, Result};
use crate::ddl::reorg::ReorgTask;
use crate::ddl::step::{Step, expect_state, mismatched_args, unexpected_state};
use crate::model::{IndexInfo, Job, JobArgs, JobState, SchemaState, TableInfo};

fn index_state(table: &TableInfo, name: &str) -> Result<SchemaState> {
    table
        .index(name)
        .map(|i| i.state)
        .ok_or_else(|| DdlError::IndexNotFound(name.to_string()))
}

fn set_index_state(mut table: TableInfo, name: &str, state: SchemaState) -> Result<Step<TableInfo>> {
    let index = table.index_mut(name).ok_or_else(|| DdlError::IndexNotFound(name.to_string()))?;
    index.state = state;
    Ok(Step::Advance { obj: table, state })
}

fn remove_index_step(mut table: TableInfo, name: &str, job: &Job, done: JobState) -> Result<Step<TableInfo>> {
    let index = table.index(name).ok_or_else(|| DdlError::IndexNotFound(name.to_string()))?;
    if let Some(next) = index.state.next_removal_state() {
        return set_index_state(table, name, next);
    }
    if index.state != SchemaState::DeleteReorganization {
        return Err(unexpected_state(&format!("index '{}'", name), index.state));
    }
    if !job.reorg_done {
        return Ok(Step::Reorganize(ReorgTask::DropIndex { table_id: table.id, index_id: index.id }));
    }
    table.remove_index(name);
    Ok(Step::Finish { obj: Some(table), state: SchemaState::None, job_state: done })
}

pub fn on_add_index(mut table: TableInfo, job: &Job) -> Result<Step<TableInfo>> {
    let JobArgs::AddIndex { name, columns, unique } = &job.args else {
        return Err(mismatched_args());
    };
    if job.state == JobState::Cancelling {
        return remove_index_step(table, name, job, JobState::RollbackDone);
    }

    match job.schema_state {
        SchemaState::None => {
            check_table_public(&table)?;
            if table.index(name).is_some() {
                return Err(DdlError::IndexExists(name.clone()));
            }
            if columns.is_empty() {
                return Err(DdlError::InvalidDefinition(format!("index '{}' has no columns", name)));
            }
            let mut seen = HashSet::new();
            for col in columns {
                if !table.column(col).is_some_and(|c| c.state.is_readable()) {
                    return Err(DdlError::ColumnNotFound(col.clone()));
                }
                if !seen.insert(col.to_lowercase()) {
                    return Err(DdlError::InvalidDefinition(format!("column '{}' listed twice in index '{}'", col, name)));
                }
            }
            let id = table.alloc_index_id();
            table.indices.push(IndexInfo {
                id,
                name: name.clone(),
                columns: columns.clone(),
                unique: *unique,
                state: SchemaState::DeleteOnly,
            });
            Ok(Step::Advance { obj: table, state: SchemaState::DeleteOnly })
        }
        SchemaState::DeleteOnly => {
            expect_state("index", index_state(&table, name)?, SchemaState::DeleteOnly)?;
            set_index_state(table, name, SchemaState::WriteOnly)
        }
        SchemaState::WriteOnly => {
            expect_state("index", index_state(&table, name)?, SchemaState::WriteOnly)?;
            set_index_state(table, name, SchemaState::WriteReorganization)
        }
        SchemaState::WriteReorganization => {
            let index = table.index(name).cloned().ok_or_else(|| DdlError::IndexNotFound(name.clone()))?;
            expect_state("index", index.state, SchemaState::WriteReorganization)?;
            if !job.reorg_done {
                return Ok(Step::Reorganize(ReorgTask::AddIndex { table, index }));
            }
            match set_index_state(table, name, SchemaState::Public)? {
                Step::Advance { obj, state } => Ok(Step::Finish { obj: Some(obj), state, job_state: JobState::Done }),
                other => Ok(other),
            }
        }
        state => Err(unexpected_state("add index job", state)),
    }
}

pub fn on_drop_index(table: TableInfo, job: &Job) -> Result<Step<TableInfo>> {
    let JobArgs::DropIndex { name } = &job.args else {
        return Err(mismatched_args());
    };
    if job.state == JobState::Cancelling {
        expect_state("index", index_state(&table, name)?, SchemaState::WriteOnly)?;
        return match set_index_state(table, name, SchemaState::Public)? {
            Step::Advance { obj, state } => Ok(Step::Finish { obj: Some(obj), state, job_state: JobState::RollbackDone }),
            other => Ok(other),
        };
    }

    if job.schema_state == SchemaState::Public {
        check_table_public(&table)?;
        if !table.index(name).is_some_and(|i| i.state == SchemaState::Public) {
            return Err(DdlError::IndexNotFound(name.clone()));
        }
    } else {
        expect_state("index", index_state(&table, name)?, job.schema_state)?;
    }
    remove_index_step(table, name, job, JobState::Done)
}
