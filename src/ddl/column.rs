// Column state machine
//
// Add:  None -> DeleteOnly -> WriteOnly -> WriteReorganization -> Public
// Drop: Public -> WriteOnly -> DeleteOnly -> DeleteReorganization -> None
//
// A failed add unwinds along the drop path from wherever it stopped. A
// cancelled drop can only return to Public from WriteOnly.

use crate::ddl::error::{DdlError, Result};
use crate::ddl::reorg::ReorgTask;
use crate::ddl::step::{Step, expect_state, mismatched_args, unexpected_state};
use crate::evaluator::{Evaluator, coerce};
use crate::model::{ColumnInfo, ColumnPosition, Job, JobArgs, JobState, SchemaState, TableInfo};

/// Reject defaults that cannot be evaluated or coerced, and NOT NULL
/// columns that would end up NULL
pub(crate) fn check_default(col: &ColumnInfo, evaluator: &dyn Evaluator, require_default: bool) -> Result<()> {
    let Some(expr) = &col.default else {
        if col.not_null && require_default {
            return Err(DdlError::NotNullWithoutDefault(col.name.clone()));
        }
        return Ok(());
    };
    let invalid = |reason: String| DdlError::InvalidDefault { column: col.name.clone(), reason };
    let value = evaluator.eval(expr).map_err(|e| invalid(e.to_string()))?;
    let value = coerce(value, col.data_type).map_err(|e| invalid(e.to_string()))?;
    if value.is_null() && col.not_null {
        return Err(invalid("NULL default for a NOT NULL column".to_string()));
    }
    Ok(())
}

pub(crate) fn check_table_public(table: &TableInfo) -> Result<()> {
    if table.state != SchemaState::Public {
        return Err(DdlError::TableNotFound(table.name.clone()));
    }
    Ok(())
}

fn column_state(table: &TableInfo, name: &str) -> Result<SchemaState> {
    table
        .column(name)
        .map(|c| c.state)
        .ok_or_else(|| DdlError::ColumnNotFound(name.to_string()))
}

fn set_column_state(mut table: TableInfo, name: &str, state: SchemaState) -> Result<Step<TableInfo>> {
    let col = table.column_mut(name).ok_or_else(|| DdlError::ColumnNotFound(name.to_string()))?;
    col.state = state;
    Ok(Step::Advance { obj: table, state })
}

/// One step down the removal path, shared by drops and add rollbacks
fn remove_column_step(mut table: TableInfo, name: &str, job: &Job, done: JobState) -> Result<Step<TableInfo>> {
    let col = table.column(name).ok_or_else(|| DdlError::ColumnNotFound(name.to_string()))?;
    if let Some(next) = col.state.next_removal_state() {
        return set_column_state(table, name, next);
    }
    if col.state != SchemaState::DeleteReorganization {
        return Err(unexpected_state(&format!("column '{}'", name), col.state));
    }
    if !job.reorg_done {
        return Ok(Step::Reorganize(ReorgTask::DropColumn { table_id: table.id, column_id: col.id }));
    }
    table.remove_column(name);
    Ok(Step::Finish { obj: Some(table), state: SchemaState::None, job_state: done })
}

pub fn on_add_column(table: TableInfo, job: &Job, evaluator: &dyn Evaluator) -> Result<Step<TableInfo>> {
    let JobArgs::AddColumn { column, position } = &job.args else {
        return Err(mismatched_args());
    };
    if job.state == JobState::Cancelling {
        return remove_column_step(table, &column.name, job, JobState::RollbackDone);
    }

    match job.schema_state {
        SchemaState::None => insert_column(table, column, position, evaluator),
        SchemaState::DeleteOnly => {
            expect_state("column", column_state(&table, &column.name)?, SchemaState::DeleteOnly)?;
            set_column_state(table, &column.name, SchemaState::WriteOnly)
        }
        SchemaState::WriteOnly => {
            expect_state("column", column_state(&table, &column.name)?, SchemaState::WriteOnly)?;
            set_column_state(table, &column.name, SchemaState::WriteReorganization)
        }
        SchemaState::WriteReorganization => {
            let col = table
                .column(&column.name)
                .cloned()
                .ok_or_else(|| DdlError::ColumnNotFound(column.name.clone()))?;
            expect_state("column", col.state, SchemaState::WriteReorganization)?;
            if !job.reorg_done {
                return Ok(Step::Reorganize(ReorgTask::AddColumn { table, column: col }));
            }
            match set_column_state(table, &column.name, SchemaState::Public)? {
                Step::Advance { obj, state } => Ok(Step::Finish { obj: Some(obj), state, job_state: JobState::Done }),
                other => Ok(other),
            }
        }
        state => Err(unexpected_state("add column job", state)),
    }
}

/// First step of an add: validate, then insert the column as DeleteOnly at
/// its resolved position
fn insert_column(
    mut table: TableInfo,
    column: &ColumnInfo,
    position: &ColumnPosition,
    evaluator: &dyn Evaluator,
) -> Result<Step<TableInfo>> {
    check_table_public(&table)?;
    if table.column(&column.name).is_some() {
        return Err(DdlError::ColumnExists(column.name.clone()));
    }
    if let ColumnPosition::After(anchor) = position {
        if !table.column(anchor).is_some_and(|c| c.state.is_readable()) {
            return Err(DdlError::ColumnNotFound(anchor.clone()));
        }
    }
    check_default(column, evaluator, true)?;

    let mut col = column.clone();
    col.id = table.alloc_column_id();
    col.state = SchemaState::DeleteOnly;
    table
        .insert_column(col, position)
        .ok_or_else(|| DdlError::ColumnNotFound(column.name.clone()))?;
    Ok(Step::Advance { obj: table, state: SchemaState::DeleteOnly })
}

pub fn on_drop_column(table: TableInfo, job: &Job) -> Result<Step<TableInfo>> {
    let JobArgs::DropColumn { name } = &job.args else {
        return Err(mismatched_args());
    };
    if job.state == JobState::Cancelling {
        expect_state("column", column_state(&table, name)?, SchemaState::WriteOnly)?;
        return match set_column_state(table, name, SchemaState::Public)? {
            Step::Advance { obj, state } => Ok(Step::Finish { obj: Some(obj), state, job_state: JobState::RollbackDone }),
            other => Ok(other),
        };
    }

    if job.schema_state == SchemaState::Public {
        check_table_public(&table)?;
        let col = table
            .column(name)
            .filter(|c| c.state == SchemaState::Public)
            .ok_or_else(|| DdlError::ColumnNotFound(name.clone()))?;
        if let Some(index) = table.indices.iter().find(|i| i.covers(&col.name)) {
            return Err(DdlError::ColumnHasIndex { column: col.name.clone(), index: index.name.clone() });
        }
        if table.public_columns().len() == 1 {
            return Err(DdlError::CantDropLastColumn(col.name.clone()));
        }
    } else {
        expect_state("column", column_state(&table, name)?, job.schema_state)?;
    }
    remove_column_step(table, name, job, JobState::Done)
}
