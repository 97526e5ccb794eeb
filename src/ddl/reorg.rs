// Backfill (reorganization)
//
// Brings stored data in line with an object that sits in a reorganization
// state. The key range of the table is split into disjoint sub-ranges, each
// walked in batches by its own worker. Every batch is one short transaction
// that also records the sub-range checkpoint, so a restarted backfill picks
// up exactly after the last committed batch.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::common::{ColumnId, DataValue, Handle, IndexId, TableId};
use crate::config::DdlConfig;
use crate::ddl::callback::Callback;
use crate::ddl::error::{DdlError, Result};
use crate::ddl::owner::LeaseGuard;
use crate::evaluator::Evaluator;
use crate::meta::Meta;
use crate::model::{ColumnInfo, IndexInfo, Job, ReorgCheckpoint, ReorgRange, TableInfo};
use crate::storage::codec::{
    column_key, decode_row_marker, index_prefix, key_after, prefix_end, row_marker_key, row_marker_prefix,
    table_prefix,
};
use crate::storage::{Storage, Transaction, run_in_new_txn};
use crate::table::{create_index_entry, decode_datum, encode_datum, eval_default};

/// Data migration required before a job can leave a reorganization state
#[derive(Debug, Clone, PartialEq)]
pub enum ReorgTask {
    /// Write the default of `column` into every row that lacks a value
    AddColumn { table: TableInfo, column: ColumnInfo },
    /// Remove every stored value of a column
    DropColumn { table_id: TableId, column_id: ColumnId },
    /// Write an index entry for every row
    AddIndex { table: TableInfo, index: IndexInfo },
    /// Remove every entry of an index
    DropIndex { table_id: TableId, index_id: IndexId },
    /// Remove every key of a table
    DropTable { table_id: TableId },
}

impl ReorgTask {
    pub fn table_id(&self) -> TableId {
        match self {
            ReorgTask::AddColumn { table, .. } | ReorgTask::AddIndex { table, .. } => table.id,
            ReorgTask::DropColumn { table_id, .. }
            | ReorgTask::DropIndex { table_id, .. }
            | ReorgTask::DropTable { table_id } => *table_id,
        }
    }

    /// Tasks that walk rows rather than raw keys can be split by handle
    fn walks_rows(&self) -> bool {
        matches!(
            self,
            ReorgTask::AddColumn { .. } | ReorgTask::DropColumn { .. } | ReorgTask::AddIndex { .. }
        )
    }

    /// Full key range the task scans
    fn key_range(&self) -> (Vec<u8>, Vec<u8>) {
        let start = match self {
            ReorgTask::DropIndex { table_id, index_id } => index_prefix(*table_id, *index_id),
            ReorgTask::DropTable { table_id } => table_prefix(*table_id),
            _ => row_marker_prefix(self.table_id()),
        };
        let end = prefix_end(&start);
        (start, end)
    }
}

/// Per-key work, resolved once before the scan starts
enum BatchOp {
    FillColumn { table_id: TableId, column_id: ColumnId, value: Vec<u8> },
    DeleteColumn { table_id: TableId, column_id: ColumnId },
    IndexRow { table_id: TableId, index: IndexInfo, columns: Vec<(ColumnId, DataValue)> },
    DeleteKey,
}

impl BatchOp {
    fn prepare(task: &ReorgTask, evaluator: &dyn Evaluator) -> Result<Self> {
        Ok(match task {
            ReorgTask::AddColumn { table, column } => BatchOp::FillColumn {
                table_id: table.id,
                column_id: column.id,
                value: encode_datum(&eval_default(evaluator, column)?)?,
            },
            ReorgTask::DropColumn { table_id, column_id } => {
                BatchOp::DeleteColumn { table_id: *table_id, column_id: *column_id }
            }
            ReorgTask::AddIndex { table, index } => {
                let cols = table
                    .index_columns(index)
                    .ok_or_else(|| DdlError::ColumnNotFound(index.columns.join(",")))?;
                let columns = cols
                    .into_iter()
                    .map(|c| Ok((c.id, eval_default(evaluator, c)?)))
                    .collect::<Result<Vec<_>>>()?;
                BatchOp::IndexRow { table_id: table.id, index: index.clone(), columns }
            }
            ReorgTask::DropIndex { .. } | ReorgTask::DropTable { .. } => BatchOp::DeleteKey,
        })
    }

    fn apply(&self, txn: &mut dyn Transaction, key: &[u8]) -> Result<()> {
        match self {
            BatchOp::FillColumn { table_id, column_id, value } => {
                let handle = row_handle(*table_id, key)?;
                let col_key = column_key(*table_id, handle, *column_id);
                // rows written since WriteOnly already carry a value
                if txn.get(&col_key)?.is_none() {
                    txn.set(&col_key, value)?;
                }
            }
            BatchOp::DeleteColumn { table_id, column_id } => {
                let handle = row_handle(*table_id, key)?;
                txn.delete(&column_key(*table_id, handle, *column_id))?;
            }
            BatchOp::IndexRow { table_id, index, columns } => {
                let handle = row_handle(*table_id, key)?;
                let mut values = Vec::with_capacity(columns.len());
                for (column_id, default) in columns {
                    let value = match txn.get(&column_key(*table_id, handle, *column_id))? {
                        Some(bytes) => decode_datum(&bytes)?,
                        None => default.clone(),
                    };
                    values.push(value);
                }
                create_index_entry(txn, *table_id, index, &values, handle)?;
            }
            BatchOp::DeleteKey => txn.delete(key)?,
        }
        Ok(())
    }
}

fn row_handle(table_id: TableId, key: &[u8]) -> Result<Handle> {
    decode_row_marker(table_id, key).ok_or_else(|| DdlError::Internal(format!("bad row key {}", hex::encode(key))))
}

/// Runs one backfill on behalf of the owner
pub struct Reorg<'a> {
    pub store: &'a dyn Storage,
    pub config: &'a DdlConfig,
    pub evaluator: &'a dyn Evaluator,
    pub guard: &'a dyn LeaseGuard,
    pub callback: Option<&'a dyn Callback>,
}

impl Reorg<'_> {
    /// Run `task` for `job` to completion, resuming from any persisted
    /// checkpoints. Returns the number of keys processed by this call.
    pub fn run(&self, job: &Job, task: &ReorgTask) -> Result<u64> {
        let op = BatchOp::prepare(task, self.evaluator)?;
        let plan = self.load_or_create_plan(job, task)?;
        let processed = AtomicU64::new(0);

        if plan.len() == 1 {
            self.run_range(job, &op, 0, &plan[0], &processed)?;
        } else {
            let results = crossbeam::thread::scope(|s| {
                let handles: Vec<_> = plan
                    .iter()
                    .enumerate()
                    .map(|(idx, range)| {
                        let op = &op;
                        let processed = &processed;
                        s.spawn(move |_| self.run_range(job, op, idx, range, processed))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_else(|_| Err(DdlError::Internal("backfill worker panicked".to_string()))))
                    .collect::<Vec<_>>()
            })
            .map_err(|_| DdlError::Internal("backfill scope panicked".to_string()))?;
            results.into_iter().collect::<Result<Vec<_>>>()?;
        }

        let total = processed.load(Ordering::SeqCst);
        debug!("job {} backfill finished, {} keys processed", job.id, total);
        Ok(total)
    }

    /// The persisted plan, or a fresh split of the task's key range
    fn load_or_create_plan(&self, job: &Job, task: &ReorgTask) -> Result<Vec<ReorgRange>> {
        let workers = self.config.backfill_workers;
        run_in_new_txn(self.store, self.config.retry_policy(), |txn| -> Result<Vec<ReorgRange>> {
            let mut m = Meta::new(txn);
            if let Some(plan) = m.reorg_plan(job.id)? {
                return Ok(plan);
            }
            let (start, end) = task.key_range();
            let mut bounds = Vec::new();
            if task.walks_rows() && workers > 1 {
                let first = m.txn().scan(&start, &end, 1)?;
                if let Some(low) = first.first().and_then(|(k, _)| decode_row_marker(task.table_id(), k)) {
                    let high = m.auto_id(task.table_id())?;
                    let step = (high - low + 1) / workers as i64;
                    if step > 0 {
                        bounds = (1..workers as i64)
                            .map(|i| row_marker_key(task.table_id(), low + i * step))
                            .collect();
                    }
                }
            }
            let mut plan = Vec::with_capacity(bounds.len() + 1);
            let mut lower = start;
            for bound in bounds {
                plan.push(ReorgRange { start: lower, end: bound.clone() });
                lower = bound;
            }
            plan.push(ReorgRange { start: lower, end });
            m.set_reorg_plan(job.id, &plan)?;
            Ok(plan)
        })
    }

    fn run_range(&self, job: &Job, op: &BatchOp, idx: usize, range: &ReorgRange, processed: &AtomicU64) -> Result<()> {
        let batch_size = self.config.backfill_batch_size;
        loop {
            self.guard.ensure_valid()?;
            let (ckpt, count) = run_in_new_txn(self.store, self.config.retry_policy(), |txn| -> Result<(ReorgCheckpoint, u64)> {
                let mut m = Meta::new(txn);
                let mut ckpt = m.reorg_checkpoint(job.id, idx)?.unwrap_or_else(ReorgCheckpoint::start);
                if ckpt.done {
                    return Ok((ckpt, 0));
                }
                let start = match &ckpt.last_key {
                    Some(last) => key_after(last),
                    None => range.start.clone(),
                };
                let batch = m.txn().scan(&start, &range.end, batch_size)?;
                for (key, _) in &batch {
                    op.apply(m.txn(), key)?;
                }
                if let Some((last, _)) = batch.last() {
                    ckpt.last_key = Some(last.clone());
                }
                ckpt.processed += batch.len() as u64;
                ckpt.done = batch.len() < batch_size;
                m.set_reorg_checkpoint(job.id, idx, &ckpt)?;
                Ok((ckpt, batch.len() as u64))
            })?;

            processed.fetch_add(count, Ordering::SeqCst);
            debug!(
                "job {} backfill range {} at {} keys, last key {}",
                job.id,
                idx,
                ckpt.processed,
                ckpt.last_key.as_deref().map(hex::encode).unwrap_or_default()
            );
            if let Some(cb) = self.callback {
                cb.on_reorg_batch(job, idx, ckpt.processed);
            }
            if ckpt.done {
                return Ok(());
            }
        }
    }
}
