//! Schema Model Module
//!
//! Serializable catalog objects, DDL jobs and coordination records shared by
//! every node through the store.

pub mod job;
pub mod lease;
pub mod reorg;
pub mod schema_state;
pub mod table;

pub use self::job::{ErrorClass, Job, JobArgs, JobError, JobState, JobType};
pub use self::lease::{Lease, NodeStatus, SchemaDiff};
pub use self::reorg::{ReorgCheckpoint, ReorgRange};
pub use self::schema_state::SchemaState;
pub use self::table::{ColumnInfo, ColumnPosition, DbInfo, IndexInfo, TableInfo};
