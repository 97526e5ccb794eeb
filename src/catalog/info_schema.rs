//! Schema Snapshot Module
//!
//! An `InfoSchema` is an immutable view of the catalog at exactly one schema
//! version. Consumers hold an `Arc` to it for the duration of a statement
//! instead of reading shared mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{SchemaId, SchemaVersion, TableId};
use crate::model::{DbInfo, TableInfo};

#[derive(Debug, Clone, Default)]
pub struct InfoSchema {
    version: SchemaVersion,
    schemas: HashMap<SchemaId, Arc<DbInfo>>,
    tables: HashMap<TableId, Arc<TableInfo>>,
}

impl InfoSchema {
    pub fn new(version: SchemaVersion, schemas: Vec<DbInfo>, tables: Vec<TableInfo>) -> Self {
        Self {
            version,
            schemas: schemas.into_iter().map(|db| (db.id, Arc::new(db))).collect(),
            tables: tables.into_iter().map(|t| (t.id, Arc::new(t))).collect(),
        }
    }

    /// Schema version this snapshot was loaded at
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Public schema by name
    pub fn schema_by_name(&self, name: &str) -> Option<Arc<DbInfo>> {
        self.schemas
            .values()
            .find(|db| db.state.is_readable() && db.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Schema by id, in any state
    pub fn schema_by_id(&self, id: SchemaId) -> Option<Arc<DbInfo>> {
        self.schemas.get(&id).cloned()
    }

    /// Public table of a public schema, by name
    pub fn table_by_name(&self, schema: &str, table: &str) -> Option<Arc<TableInfo>> {
        let db = self.schema_by_name(schema)?;
        self.tables
            .values()
            .find(|t| t.schema_id == db.id && t.state.is_readable() && t.name.eq_ignore_ascii_case(table))
            .cloned()
    }

    /// Table by id, in any state
    pub fn table_by_id(&self, id: TableId) -> Option<Arc<TableInfo>> {
        self.tables.get(&id).cloned()
    }

    /// Every table of a schema in any state, ordered by id
    pub fn tables_in(&self, schema_id: SchemaId) -> Vec<Arc<TableInfo>> {
        let mut tables: Vec<_> = self.tables.values().filter(|t| t.schema_id == schema_id).cloned().collect();
        tables.sort_by_key(|t| t.id);
        tables
    }

    /// Every schema in any state, ordered by id
    pub fn schemas(&self) -> Vec<Arc<DbInfo>> {
        let mut schemas: Vec<_> = self.schemas.values().cloned().collect();
        schemas.sort_by_key(|db| db.id);
        schemas
    }

    pub(crate) fn set_version(&mut self, version: SchemaVersion) {
        self.version = version;
    }

    /// Replace or remove one schema entry. Removing a schema drops its tables.
    pub(crate) fn apply_schema(&mut self, schema_id: SchemaId, db: Option<DbInfo>) {
        match db {
            Some(db) => {
                self.schemas.insert(schema_id, Arc::new(db));
            }
            None => {
                self.schemas.remove(&schema_id);
                self.tables.retain(|_, t| t.schema_id != schema_id);
            }
        }
    }

    /// Replace or remove one table entry
    pub(crate) fn apply_table(&mut self, table_id: TableId, table: Option<TableInfo>) {
        match table {
            Some(table) => {
                self.tables.insert(table_id, Arc::new(table));
            }
            None => {
                self.tables.remove(&table_id);
            }
        }
    }
}
