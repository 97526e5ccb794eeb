//! Table Metadata Module
//!
//! Persisted descriptions of schemas, tables, columns and indexes. Every
//! object carries its own `SchemaState`; the catalog never hides an object
//! just because it is in flight.

use serde::{Deserialize, Serialize};

use super::schema_state::SchemaState;
use crate::common::{ColumnId, DataType, IndexId, SchemaId, SchemaVersion, TableId};
use crate::evaluator::Expr;

/// A database (schema) entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbInfo {
    pub id: SchemaId,
    pub name: String,
    pub state: SchemaState,
}

impl DbInfo {
    pub fn new(id: SchemaId, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), state: SchemaState::None }
    }
}

/// Where a new column goes relative to the existing ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ColumnPosition {
    /// Append after the last column
    #[default]
    None,
    First,
    After(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column ID, never reused within a table
    pub id: ColumnId,
    pub name: String,
    /// Position in the declared column order
    pub offset: usize,
    pub data_type: DataType,
    /// Rejects NULL on writes
    pub not_null: bool,
    /// Default value expression, evaluated for rows that do not carry a value
    pub default: Option<Expr>,
    pub state: SchemaState,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: 0,
            name: name.into(),
            offset: 0,
            data_type,
            not_null: false,
            default: None,
            state: SchemaState::None,
        }
    }

    pub fn with_default(mut self, default: Expr) -> Self {
        self.default = Some(default);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: IndexId,
    pub name: String,
    /// Indexed column names, in key order
    pub columns: Vec<String>,
    pub unique: bool,
    pub state: SchemaState,
}

impl IndexInfo {
    pub fn covers(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Full description of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub schema_id: SchemaId,
    pub name: String,
    /// All columns in every state, ordered by offset
    pub columns: Vec<ColumnInfo>,
    pub indices: Vec<IndexInfo>,
    pub state: SchemaState,
    /// Largest column id handed out so far
    pub max_column_id: ColumnId,
    /// Largest index id handed out so far
    pub max_index_id: IndexId,
    /// Schema version of the last change to this table
    pub update_version: SchemaVersion,
}

impl TableInfo {
    /// Build a table from its initial columns, assigning ids and offsets
    pub fn new(id: TableId, schema_id: SchemaId, name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        let mut table = Self {
            id,
            schema_id,
            name: name.into(),
            columns,
            indices: Vec::new(),
            state: SchemaState::None,
            max_column_id: 0,
            max_index_id: 0,
            update_version: 0,
        };
        for col in table.columns.iter_mut() {
            table.max_column_id += 1;
            col.id = table.max_column_id;
        }
        table.reindex_offsets();
        table
    }

    /// Column by name, in any state
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnInfo> {
        self.columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Columns visible to reads, in offset order
    pub fn public_columns(&self) -> Vec<&ColumnInfo> {
        self.columns.iter().filter(|c| c.state.is_readable()).collect()
    }

    /// Columns that inserts and updates must write, in offset order
    pub fn writable_columns(&self) -> Vec<&ColumnInfo> {
        self.columns.iter().filter(|c| c.state.is_writable()).collect()
    }

    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.indices.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn index_mut(&mut self, name: &str) -> Option<&mut IndexInfo> {
        self.indices.iter_mut().find(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// Columns of `index`, in key order. `None` if one of them is gone.
    pub fn index_columns(&self, index: &IndexInfo) -> Option<Vec<&ColumnInfo>> {
        index.columns.iter().map(|name| self.column(name)).collect()
    }

    /// Insert `col` at the resolved `position` and renumber every offset.
    /// Returns the offset the column landed on.
    pub fn insert_column(&mut self, col: ColumnInfo, position: &ColumnPosition) -> Option<usize> {
        let at = match position {
            ColumnPosition::None => self.columns.len(),
            ColumnPosition::First => 0,
            ColumnPosition::After(name) => {
                let idx = self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))?;
                idx + 1
            }
        };
        self.columns.insert(at, col);
        self.reindex_offsets();
        Some(at)
    }

    /// Remove a column from the catalog and close the gap in the offsets
    pub fn remove_column(&mut self, name: &str) -> Option<ColumnInfo> {
        let idx = self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))?;
        let col = self.columns.remove(idx);
        self.reindex_offsets();
        Some(col)
    }

    pub fn remove_index(&mut self, name: &str) -> Option<IndexInfo> {
        let idx = self.indices.iter().position(|i| i.name.eq_ignore_ascii_case(name))?;
        Some(self.indices.remove(idx))
    }

    pub fn alloc_column_id(&mut self) -> ColumnId {
        self.max_column_id += 1;
        self.max_column_id
    }

    pub fn alloc_index_id(&mut self) -> IndexId {
        self.max_index_id += 1;
        self.max_index_id
    }

    fn reindex_offsets(&mut self) {
        for (offset, col) in self.columns.iter_mut().enumerate() {
            col.offset = offset;
        }
    }
}
