//! Table Data Module
//!
//! Row-level reads and writes that honour the schema state of every column
//! and index. A row is stored as a marker key plus one key per column value,
//! and the states decide which of those keys a statement touches:
//!
//! - reads only return public columns and only use public indexes
//! - inserts and updates write every writable column and index entry,
//!   filling columns the statement cannot see with their default
//! - deletes remove every key of the row and every deletable index entry

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{ColumnId, DataValue, Handle, TableId};
use crate::ddl::error::{DdlError, Result};
use crate::evaluator::{Evaluator, coerce};
use crate::meta::Meta;
use crate::model::{ColumnInfo, IndexInfo, TableInfo};
use crate::storage::Transaction;
use crate::storage::codec::{
    column_key, decode_i64, decode_row_marker, encode_handle_value, index_key, key_after, prefix_end,
    row_columns_prefix, row_marker_key, row_marker_prefix,
};

const SCAN_BATCH: usize = 256;

pub(crate) fn encode_datum(value: &DataValue) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode_datum(bytes: &[u8]) -> Result<DataValue> {
    Ok(bincode::deserialize(bytes)?)
}

/// Default value of `col`, coerced to its type. Columns without a default
/// read as NULL.
pub(crate) fn eval_default(evaluator: &dyn Evaluator, col: &ColumnInfo) -> Result<DataValue> {
    match &col.default {
        Some(expr) => Ok(coerce(evaluator.eval(expr)?, col.data_type)?),
        None => Ok(DataValue::Null),
    }
}

/// Unique indexes only enforce uniqueness when no key column is NULL
fn is_distinct(index: &IndexInfo, values: &[DataValue]) -> bool {
    index.unique && !values.iter().any(DataValue::is_null)
}

fn format_key(values: &[DataValue]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("-")
}

/// Write the entry of `handle` into `index`. Fails with `DuplicateEntry`
/// if a unique key already belongs to another row.
pub(crate) fn create_index_entry(
    txn: &mut dyn Transaction,
    table_id: TableId,
    index: &IndexInfo,
    values: &[DataValue],
    handle: Handle,
) -> Result<()> {
    let handle_value = encode_handle_value(handle);
    if is_distinct(index, values) {
        let key = index_key(table_id, index.id, values, None);
        if let Some(existing) = txn.get(&key)? {
            if decode_i64(&existing) != Some(handle) {
                return Err(DdlError::DuplicateEntry { index: index.name.clone(), key: format_key(values) });
            }
        }
        txn.set(&key, &handle_value)?;
    } else {
        txn.set(&index_key(table_id, index.id, values, Some(handle)), &handle_value)?;
    }
    Ok(())
}

/// Remove the entry of `handle` from `index`, leaving a unique key alone if
/// another row owns it
pub(crate) fn delete_index_entry(
    txn: &mut dyn Transaction,
    table_id: TableId,
    index: &IndexInfo,
    values: &[DataValue],
    handle: Handle,
) -> Result<()> {
    if is_distinct(index, values) {
        let key = index_key(table_id, index.id, values, None);
        if let Some(existing) = txn.get(&key)? {
            if decode_i64(&existing) == Some(handle) {
                txn.delete(&key)?;
            }
        }
    } else {
        txn.delete(&index_key(table_id, index.id, values, Some(handle)))?;
    }
    Ok(())
}

/// DML handle for one table at one schema version
#[derive(Clone)]
pub struct Table {
    info: Arc<TableInfo>,
    evaluator: Arc<dyn Evaluator>,
}

impl Table {
    pub fn new(info: Arc<TableInfo>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self { info, evaluator }
    }

    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    pub fn id(&self) -> TableId {
        self.info.id
    }

    /// Columns visible to reads
    pub fn cols(&self) -> Vec<&ColumnInfo> {
        self.info.public_columns()
    }

    /// Columns that inserts and updates maintain
    pub fn writable_cols(&self) -> Vec<&ColumnInfo> {
        self.info.writable_columns()
    }

    pub fn default_value(&self, col: &ColumnInfo) -> Result<DataValue> {
        eval_default(self.evaluator.as_ref(), col)
    }

    /// Insert a row and return its handle. `row` carries either one value per
    /// public column, or one value per writable column.
    pub fn add_record(&self, txn: &mut dyn Transaction, row: &[DataValue]) -> Result<Handle> {
        self.check_writable()?;
        let values = self.fill_writable(row, |_| None)?;
        let handle = Meta::new(&mut *txn).gen_auto_id(self.info.id, 1)?;

        txn.set(&row_marker_key(self.info.id, handle), &[])?;
        for (col_id, value) in &values {
            txn.set(&column_key(self.info.id, handle, *col_id), &encode_datum(value)?)?;
        }
        let by_id: HashMap<ColumnId, DataValue> = values.into_iter().collect();
        for index in self.info.indices.iter().filter(|i| i.state.is_writable()) {
            let key_values = self.index_values(index, &by_id)?;
            create_index_entry(txn, self.info.id, index, &key_values, handle)?;
        }
        Ok(handle)
    }

    /// Replace the values of an existing row. Columns the statement cannot
    /// see keep their stored value, or get their default if they have none.
    pub fn update_record(&self, txn: &mut dyn Transaction, handle: Handle, row: &[DataValue]) -> Result<()> {
        self.check_writable()?;
        let old = self.stored_row(txn, handle)?.ok_or(DdlError::RowNotFound(handle))?;
        let values = self.fill_writable(row, |col| old.get(&col.id).cloned())?;

        for index in self.info.indices.iter().filter(|i| i.state.is_deletable()) {
            let key_values = self.index_values(index, &old)?;
            delete_index_entry(txn, self.info.id, index, &key_values, handle)?;
        }
        for (col_id, value) in &values {
            txn.set(&column_key(self.info.id, handle, *col_id), &encode_datum(value)?)?;
        }
        let mut merged = old;
        merged.extend(values);
        for index in self.info.indices.iter().filter(|i| i.state.is_writable()) {
            let key_values = self.index_values(index, &merged)?;
            create_index_entry(txn, self.info.id, index, &key_values, handle)?;
        }
        Ok(())
    }

    /// Delete a row with every stored value and every deletable index entry
    pub fn remove_record(&self, txn: &mut dyn Transaction, handle: Handle) -> Result<()> {
        if !self.info.state.is_deletable() {
            return Err(DdlError::TableNotFound(self.info.name.clone()));
        }
        let Some(stored) = self.stored_row(txn, handle)? else {
            return Err(DdlError::RowNotFound(handle));
        };
        for index in self.info.indices.iter().filter(|i| i.state.is_deletable()) {
            let key_values = self.index_values(index, &stored)?;
            delete_index_entry(txn, self.info.id, index, &key_values, handle)?;
        }
        // Deletable columns are removed whether or not this snapshot saw a
        // value, so a concurrent backfill write to the same key conflicts.
        let deletable = self.info.columns.iter().filter(|c| c.state.is_deletable()).map(|c| c.id);
        let mut col_ids: Vec<ColumnId> = stored.keys().copied().chain(deletable).collect();
        col_ids.sort_unstable();
        col_ids.dedup();
        for col_id in col_ids {
            txn.delete(&column_key(self.info.id, handle, col_id))?;
        }
        txn.delete(&row_marker_key(self.info.id, handle))?;
        Ok(())
    }

    /// Values of `cols` for one row, `None` if the row does not exist.
    /// Missing column values read as the column default.
    pub fn row_with_cols(
        &self,
        txn: &mut dyn Transaction,
        handle: Handle,
        cols: &[&ColumnInfo],
    ) -> Result<Option<Vec<DataValue>>> {
        if txn.get(&row_marker_key(self.info.id, handle))?.is_none() {
            return Ok(None);
        }
        let mut row = Vec::with_capacity(cols.len());
        for col in cols {
            let value = match txn.get(&column_key(self.info.id, handle, col.id))? {
                Some(bytes) => decode_datum(&bytes)?,
                None => self.default_value(col)?,
            };
            row.push(value);
        }
        Ok(Some(row))
    }

    /// Public values of one row
    pub fn row(&self, txn: &mut dyn Transaction, handle: Handle) -> Result<Option<Vec<DataValue>>> {
        let cols = self.cols();
        self.row_with_cols(txn, handle, &cols)
    }

    /// Visit rows in handle order until `f` returns false
    pub fn iter_records<F>(&self, txn: &mut dyn Transaction, cols: &[&ColumnInfo], mut f: F) -> Result<()>
    where
        F: FnMut(Handle, Vec<DataValue>) -> Result<bool>,
    {
        let prefix = row_marker_prefix(self.info.id);
        let end = prefix_end(&prefix);
        let mut start = prefix;
        loop {
            let batch = txn.scan(&start, &end, SCAN_BATCH)?;
            for (key, _) in &batch {
                let handle = decode_row_marker(self.info.id, key)
                    .ok_or_else(|| DdlError::Internal(format!("bad row key {}", hex::encode(key))))?;
                if let Some(row) = self.row_with_cols(txn, handle, cols)? {
                    if !f(handle, row)? {
                        return Ok(());
                    }
                }
            }
            match batch.last() {
                Some((last, _)) if batch.len() == SCAN_BATCH => start = key_after(last),
                _ => return Ok(()),
            }
        }
    }

    /// All rows with their public values, in handle order
    pub fn rows(&self, txn: &mut dyn Transaction) -> Result<Vec<(Handle, Vec<DataValue>)>> {
        let cols = self.cols();
        let mut rows = Vec::new();
        self.iter_records(txn, &cols, |handle, row| {
            rows.push((handle, row));
            Ok(true)
        })?;
        Ok(rows)
    }

    /// Raw stored value of one column, without default substitution
    pub fn stored_value(&self, txn: &mut dyn Transaction, handle: Handle, col_id: ColumnId) -> Result<Option<DataValue>> {
        match txn.get(&column_key(self.info.id, handle, col_id))? {
            Some(bytes) => Ok(Some(decode_datum(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of column values physically stored for one row
    pub fn stored_column_count(&self, txn: &mut dyn Transaction, handle: Handle) -> Result<usize> {
        let prefix = row_columns_prefix(self.info.id, handle);
        Ok(txn.scan(&prefix, &prefix_end(&prefix), usize::MAX)?.len())
    }

    /// Handles whose public index entry matches `values`
    pub fn index_lookup(&self, txn: &mut dyn Transaction, index_name: &str, values: &[DataValue]) -> Result<Vec<Handle>> {
        let index = self
            .info
            .index(index_name)
            .filter(|i| i.state.is_readable())
            .ok_or_else(|| DdlError::IndexNotFound(index_name.to_string()))?;
        let prefix = index_key(self.info.id, index.id, values, None);
        txn.scan(&prefix, &prefix_end(&prefix), usize::MAX)?
            .iter()
            .map(|(_, v)| decode_i64(v).ok_or_else(|| DdlError::Internal("bad index value".to_string())))
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        if !self.info.state.is_writable() {
            return Err(DdlError::TableNotFound(self.info.name.clone()));
        }
        Ok(())
    }

    /// Map a statement row onto the writable columns. Hidden columns take
    /// `hidden(col)` if given, otherwise their default.
    fn fill_writable<H>(&self, row: &[DataValue], hidden: H) -> Result<Vec<(ColumnId, DataValue)>>
    where
        H: Fn(&ColumnInfo) -> Option<DataValue>,
    {
        let writable = self.writable_cols();
        let public_count = writable.iter().filter(|c| c.state.is_readable()).count();
        let mut values = Vec::with_capacity(writable.len());
        if row.len() == writable.len() {
            for (col, value) in writable.iter().zip(row) {
                values.push((*col, value.clone()));
            }
        } else if row.len() == public_count {
            let mut given = row.iter();
            for col in &writable {
                let value = if col.state.is_readable() {
                    given.next().cloned().unwrap_or(DataValue::Null)
                } else {
                    match hidden(col) {
                        Some(v) => v,
                        None => self.default_value(col)?,
                    }
                };
                values.push((*col, value));
            }
        } else {
            return Err(DdlError::ColumnCountMismatch { expected: public_count, got: row.len() });
        }

        values
            .into_iter()
            .map(|(col, value)| {
                let value = coerce(value, col.data_type)?;
                if value.is_null() && col.not_null {
                    return Err(DdlError::NullValue(col.name.clone()));
                }
                Ok((col.id, value))
            })
            .collect()
    }

    /// Stored values of a row keyed by column id, `None` if it does not exist
    fn stored_row(&self, txn: &mut dyn Transaction, handle: Handle) -> Result<Option<HashMap<ColumnId, DataValue>>> {
        if txn.get(&row_marker_key(self.info.id, handle))?.is_none() {
            return Ok(None);
        }
        let prefix = row_columns_prefix(self.info.id, handle);
        let mut row = HashMap::new();
        for (key, value) in txn.scan(&prefix, &prefix_end(&prefix), usize::MAX)? {
            let col_id = decode_i64(&key[prefix.len()..])
                .ok_or_else(|| DdlError::Internal(format!("bad column key {}", hex::encode(&key))))?;
            row.insert(col_id, decode_datum(&value)?);
        }
        Ok(Some(row))
    }

    /// Key values of `index` for a row, defaulting columns without a value
    fn index_values(&self, index: &IndexInfo, row: &HashMap<ColumnId, DataValue>) -> Result<Vec<DataValue>> {
        let cols = self
            .info
            .index_columns(index)
            .ok_or_else(|| DdlError::Internal(format!("index '{}' refers to a missing column", index.name)))?;
        cols.into_iter()
            .map(|col| match row.get(&col.id) {
                Some(v) => Ok(v.clone()),
                None => self.default_value(col),
            })
            .collect()
    }
}
