// DDL Job Model
//
// A job is the durable form of one structural change. It is appended to the
// job log by whichever node received the request and only ever advanced by
// the DDL owner.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::schema_state::SchemaState;
use super::table::{ColumnInfo, ColumnPosition, TableInfo};
use crate::common::{JobId, SchemaId, SchemaVersion, TableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    AddIndex,
    DropIndex,
}

impl JobType {
    /// Jobs that remove an object walk the state machine downwards
    pub fn is_drop(self) -> bool {
        matches!(
            self,
            JobType::DropSchema | JobType::DropTable | JobType::DropColumn | JobType::DropIndex
        )
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobType::CreateSchema => "create schema",
            JobType::DropSchema => "drop schema",
            JobType::CreateTable => "create table",
            JobType::DropTable => "drop table",
            JobType::AddColumn => "add column",
            JobType::DropColumn => "drop column",
            JobType::AddIndex => "add index",
            JobType::DropIndex => "drop index",
        };
        f.write_str(name)
    }
}

/// Per-type job arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobArgs {
    CreateSchema { name: String },
    DropSchema { name: String },
    CreateTable { table: TableInfo },
    DropTable { name: String },
    AddColumn { column: ColumnInfo, position: ColumnPosition },
    DropColumn { name: String },
    AddIndex { name: String, columns: Vec<String>, unique: bool },
    DropIndex { name: String },
}

impl JobArgs {
    pub fn job_type(&self) -> JobType {
        match self {
            JobArgs::CreateSchema { .. } => JobType::CreateSchema,
            JobArgs::DropSchema { .. } => JobType::DropSchema,
            JobArgs::CreateTable { .. } => JobType::CreateTable,
            JobArgs::DropTable { .. } => JobType::DropTable,
            JobArgs::AddColumn { .. } => JobType::AddColumn,
            JobArgs::DropColumn { .. } => JobType::DropColumn,
            JobArgs::AddIndex { .. } => JobType::AddIndex,
            JobArgs::DropIndex { .. } => JobType::DropIndex,
        }
    }

    /// Name of the object the job creates or removes
    pub fn object_name(&self) -> &str {
        match self {
            JobArgs::CreateSchema { name }
            | JobArgs::DropSchema { name }
            | JobArgs::DropTable { name }
            | JobArgs::DropColumn { name }
            | JobArgs::AddIndex { name, .. }
            | JobArgs::DropIndex { name } => name,
            JobArgs::CreateTable { table } => &table.name,
            JobArgs::AddColumn { column, .. } => &column.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Queued, nothing changed yet
    Pending,
    /// At least one transition committed
    Running,
    /// Running the reverse sequence after a failure or a cancel request
    Cancelling,
    Done,
    /// Reverse sequence completed
    RollbackDone,
    /// Ended before any mutation
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::RollbackDone | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Done => "done",
            JobState::RollbackDone => "rollback done",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Coarse classification of job failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Store timeouts, write conflicts, lost leases. Retried.
    Infrastructure,
    /// Duplicate names, missing objects, dependent objects. Fails fast.
    Structural,
    /// A row failed evaluation or a constraint during backfill. Rolls back.
    Data,
    /// The submitter cancelled the job
    Cancelled,
}

/// Error recorded on a job, persisted with it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
}

impl JobError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into() }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorClass::Cancelled, "cancelled by user")
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub schema_id: SchemaId,
    /// Target table, `SCHEMA_LANE` for schema-level jobs
    pub table_id: TableId,
    pub args: JobArgs,
    pub state: JobState,
    /// State of the target object after the last committed transition
    pub schema_state: SchemaState,
    pub error: Option<JobError>,
    /// Version produced by the last committed transition, 0 before the first
    pub schema_version: SchemaVersion,
    /// Set once the backfill for the current reorganization state finished
    pub reorg_done: bool,
    /// Rows or keys touched by backfill passes
    pub row_count: u64,
    pub cancel_requested: bool,
    /// Wall-clock millis at submission
    pub submitted_ms: u64,
}

impl Job {
    pub fn new(id: JobId, schema_id: SchemaId, table_id: TableId, args: JobArgs) -> Self {
        let schema_state = if args.job_type().is_drop() {
            SchemaState::Public
        } else {
            SchemaState::None
        };
        Self {
            id,
            schema_id,
            table_id,
            args,
            state: JobState::Pending,
            schema_state,
            error: None,
            schema_version: 0,
            reorg_done: false,
            row_count: 0,
            cancel_requested: false,
            submitted_ms: 0,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.args.job_type()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a cancel request can still be honoured. Add paths can be
    /// unwound until backfill starts; drop paths only while the object is
    /// still maintained by writes.
    pub fn is_cancellable(&self) -> bool {
        match self.state {
            JobState::Pending => true,
            JobState::Running => match self.job_type() {
                JobType::AddColumn | JobType::AddIndex => matches!(
                    self.schema_state,
                    SchemaState::None | SchemaState::DeleteOnly | SchemaState::WriteOnly
                ),
                JobType::DropColumn | JobType::DropIndex | JobType::DropTable | JobType::DropSchema => {
                    self.schema_state == SchemaState::WriteOnly
                }
                JobType::CreateSchema | JobType::CreateTable => false,
            },
            _ => false,
        }
    }

    /// Whether a failure may still be answered with a rollback. A drop past
    /// `WriteOnly` has stopped maintaining the object and can only finish.
    pub fn can_roll_back(&self) -> bool {
        !self.job_type().is_drop() || self.schema_state == SchemaState::WriteOnly
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID:{}, Type:{} `{}`, State:{}, SchemaState:{}, SchemaID:{}, TableID:{}, RowCount:{}",
            self.id,
            self.job_type(),
            self.args.object_name(),
            self.state,
            self.schema_state,
            self.schema_id,
            self.table_id,
            self.row_count,
        )?;
        if let Some(err) = &self.error {
            write!(f, ", Error:{}", err)?;
        }
        Ok(())
    }
}
