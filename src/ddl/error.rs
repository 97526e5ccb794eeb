use thiserror::Error;

use crate::common::{JobId, NodeId};
use crate::evaluator::EvalError;
use crate::model::{ErrorClass, JobError, JobState};
use crate::storage::KvError;
use crate::storage::kv::Retryable;

/// Error type for catalog, DML and DDL operations
#[derive(Error, Debug)]
pub enum DdlError {
    #[error("Storage error: {0}")]
    Kv(#[from] KvError),

    #[error("Metadata codec error: {0}")]
    Codec(String),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("Node {0} lost the DDL owner lease")]
    LeaseLost(NodeId),

    #[error("Node {0} is not the DDL owner")]
    NotOwner(NodeId),

    #[error("Schema on node {0} is older than one lease, reload required")]
    SchemaExpired(NodeId),

    #[error("Schema '{0}' already exists")]
    SchemaExists(String),

    #[error("Schema '{0}' not found")]
    SchemaNotFound(String),

    #[error("Schema '{0}' still contains tables")]
    SchemaNotEmpty(String),

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' already exists")]
    ColumnExists(String),

    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Index '{0}' already exists")]
    IndexExists(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Column '{column}' is used by index '{index}'")]
    ColumnHasIndex { column: String, index: String },

    #[error("Cannot drop '{0}', a table must keep at least one column")]
    CantDropLastColumn(String),

    #[error("Column '{0}' is NOT NULL and has no default value")]
    NotNullWithoutDefault(String),

    #[error("Invalid default value for column '{column}': {reason}")]
    InvalidDefault { column: String, reason: String },

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Column count mismatch: expected {expected} values, got {got}")]
    ColumnCountMismatch { expected: usize, got: usize },

    #[error("Row {0} not found")]
    RowNotFound(i64),

    #[error("Column '{0}' cannot be NULL")]
    NullValue(String),

    #[error("Duplicate entry {key} for unique index '{index}'")]
    DuplicateEntry { index: String, key: String },

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    #[error("Job {job_id} was cancelled: {error}")]
    JobCancelled { job_id: JobId, error: JobError },

    #[error("Job {job_id} was rolled back: {error}")]
    JobRolledBack { job_id: JobId, error: JobError },

    #[error("Job {job_id} cannot be cancelled in state {state}")]
    CancelRejected { job_id: JobId, state: JobState },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("DDL is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for DdlError {
    fn from(err: bincode::Error) -> Self {
        DdlError::Codec(err.to_string())
    }
}

impl DdlError {
    /// Infrastructure errors leave the job untouched and are retried
    pub fn is_retryable(&self) -> bool {
        match self {
            DdlError::Kv(e) => e.is_retryable(),
            DdlError::LeaseLost(_) | DdlError::NotOwner(_) | DdlError::SchemaExpired(_) => true,
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DdlError::Kv(_)
            | DdlError::Codec(_)
            | DdlError::LeaseLost(_)
            | DdlError::NotOwner(_)
            | DdlError::SchemaExpired(_)
            | DdlError::Config(_)
            | DdlError::Closed
            | DdlError::Internal(_) => ErrorClass::Infrastructure,
            DdlError::Eval(_) | DdlError::NullValue(_) | DdlError::DuplicateEntry { .. } => ErrorClass::Data,
            DdlError::JobCancelled { .. } | DdlError::CancelRejected { .. } => ErrorClass::Cancelled,
            DdlError::JobRolledBack { error, .. } => error.class,
            _ => ErrorClass::Structural,
        }
    }

    /// The persisted form recorded on a job
    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.class(), self.to_string())
    }
}

impl Retryable for DdlError {
    fn is_retryable(&self) -> bool {
        DdlError::is_retryable(self)
    }
}

/// Result type for DDL operations
pub type Result<T> = std::result::Result<T, DdlError>;
