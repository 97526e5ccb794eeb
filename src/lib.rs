// Bayun Online DDL Engine

pub mod catalog;
pub mod common;
pub mod config;
pub mod ddl;
pub mod evaluator;
pub mod meta;
pub mod model;
pub mod storage;
pub mod table;

// Re-export key items for convenient access
pub use catalog::{Domain, InfoSchema};
pub use common::{DataType, DataValue};
pub use config::DdlConfig;
pub use ddl::{AlterOp, Callback, ColumnDef, Ddl, DdlError, DdlRequest};
pub use evaluator::{ConstEvaluator, Evaluator, Expr};
pub use model::{ColumnPosition, Job, JobState, SchemaState};
pub use storage::{MemStore, Storage, Transaction, run_in_new_txn};
pub use table::Table;
