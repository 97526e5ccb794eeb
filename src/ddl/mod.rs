// DDL Module
//
// Online schema changes. Any node accepts requests and appends them to the
// shared job log; the node holding the owner lease executes them one step
// at a time, publishing a new schema version after every step.

pub mod callback;
pub mod column;
pub mod error;
pub mod index;
pub mod owner;
pub mod reorg;
pub mod schema;
pub mod step;
pub mod syncer;
pub mod table;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::info;

use crate::catalog::{Domain, InfoSchema};
use crate::common::clock::now_millis;
use crate::common::{DataType, JobId, NodeId, SCHEMA_LANE, SchemaVersion, TableId};
use crate::config::DdlConfig;
use crate::evaluator::{ConstEvaluator, Evaluator, Expr};
use crate::meta::Meta;
use crate::model::{ColumnInfo, ColumnPosition, Job, JobArgs, JobError, JobState, TableInfo};
use crate::storage::{Storage, run_in_new_txn};
use crate::table::Table as TableData;

pub use callback::{Callback, NoopCallback};
pub use error::{DdlError, Result};
pub use owner::{LeaseGuard, OwnerManager};
pub use reorg::ReorgTask;
pub use step::Step;
pub use syncer::SchemaSyncer;
use worker::Worker;

/// Column definition as it arrives from the parser
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub not_null: bool,
    pub default: Option<Expr>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self { name: name.into(), data_type, not_null: false, default: None }
    }

    pub fn default_value(mut self, expr: Expr) -> Self {
        self.default = Some(expr);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    fn to_column_info(&self) -> ColumnInfo {
        let mut col = ColumnInfo::new(self.name.clone(), self.data_type);
        col.not_null = self.not_null;
        col.default = self.default.clone();
        col
    }
}

/// One structural change to an existing table
#[derive(Debug, Clone, PartialEq)]
pub enum AlterOp {
    AddColumn { column: ColumnDef, position: ColumnPosition },
    DropColumn { name: String },
    AddIndex { name: String, columns: Vec<String>, unique: bool },
    DropIndex { name: String },
}

/// A DDL statement after parsing
#[derive(Debug, Clone, PartialEq)]
pub enum DdlRequest {
    CreateSchema { name: String },
    DropSchema { name: String },
    CreateTable { schema: String, table: String, columns: Vec<ColumnDef> },
    DropTable { schema: String, table: String },
    AlterTable { schema: String, table: String, op: AlterOp },
}

/// One node's DDL handle
pub struct Ddl {
    node_id: NodeId,
    store: Arc<dyn Storage>,
    config: DdlConfig,
    domain: Arc<Domain>,
    owner: Arc<OwnerManager>,
    worker: Arc<Worker>,
    evaluator: Arc<dyn Evaluator>,
    closed: AtomicBool,
}

impl Ddl {
    /// Create a node that evaluates defaults with the built-in constant
    /// evaluator. Nothing runs until `start`.
    pub fn new(node_id: impl Into<NodeId>, store: Arc<dyn Storage>, config: DdlConfig) -> Result<Self> {
        Self::with_evaluator(node_id, store, config, Arc::new(ConstEvaluator))
    }

    pub fn with_evaluator(
        node_id: impl Into<NodeId>,
        store: Arc<dyn Storage>,
        config: DdlConfig,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = node_id.into();
        let domain = Arc::new(Domain::new(node_id.clone(), Arc::clone(&store), config.clone()));
        let owner = Arc::new(OwnerManager::new(node_id.clone(), Arc::clone(&store), config.clone()));
        let worker = Arc::new(Worker::new(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&owner),
            Arc::clone(&domain),
            Arc::clone(&evaluator),
            Arc::new(NoopCallback),
        ));
        Ok(Self {
            node_id,
            store,
            config,
            domain,
            owner,
            worker,
            evaluator,
            closed: AtomicBool::new(false),
        })
    }

    /// Install the observer invoked after every committed job change
    pub fn set_callback(&self, callback: Arc<dyn Callback>) {
        self.worker.set_callback(callback);
    }

    /// Load the schema, then start reloading, campaigning and working
    pub fn start(&self) -> Result<()> {
        self.domain.start()?;
        self.owner.start()?;
        self.worker.start()?;
        info!("[{}] DDL started", self.node_id);
        Ok(())
    }

    /// Stop every background task of this node. Jobs it was running are
    /// picked up by the next owner.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.owner.resign();
        self.worker.close();
        self.domain.close();
        info!("[{}] DDL closed", self.node_id);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_owner(&self) -> bool {
        self.owner.is_owner()
    }

    pub fn config(&self) -> &DdlConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub fn info_schema(&self) -> Result<Arc<InfoSchema>> {
        self.domain.info_schema()
    }

    /// Resolve names against the local snapshot, reloading once if the
    /// snapshot is expired or does not know the name yet
    fn resolve<T>(&self, f: impl Fn(&InfoSchema) -> Result<T>) -> Result<T> {
        let first = self.domain.info_schema().and_then(|is| f(&is));
        match first {
            Err(DdlError::SchemaExpired(_) | DdlError::SchemaNotFound(_) | DdlError::TableNotFound(_)) => {
                self.domain.reload()?;
                f(&*self.domain.info_schema()?)
            }
            other => other,
        }
    }

    /// Append a job for `request` to the job log and return its id. The
    /// job runs asynchronously on the owner.
    pub fn submit(&self, request: DdlRequest) -> Result<JobId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DdlError::Closed);
        }
        let (schema_id, table_id, args) = self.resolve(|is| job_target(is, &request))?;

        let job = run_in_new_txn(self.store.as_ref(), self.config.retry_policy(), |txn| -> Result<Job> {
            let mut m = Meta::new(txn);
            let mut args = args.clone();
            let (schema_id, table_id) = match &mut args {
                JobArgs::CreateSchema { .. } => (m.gen_global_id()?, SCHEMA_LANE),
                JobArgs::CreateTable { table } => {
                    let id = m.gen_global_id()?;
                    table.id = id;
                    table.schema_id = schema_id;
                    (schema_id, id)
                }
                _ => (schema_id, table_id),
            };
            let mut job = Job::new(m.gen_global_id()?, schema_id, table_id, args);
            job.submitted_ms = now_millis();
            m.enqueue_job(&job)?;
            Ok(job)
        })?;

        info!("[{}] submitted DDL job: {}", self.node_id, job);
        self.worker.notify();
        Ok(job.id)
    }

    /// Block until the job is finished and this node has loaded the schema
    /// version it produced
    pub fn wait(&self, job_id: JobId) -> Result<Job> {
        loop {
            let job = self.get_job(job_id)?.ok_or(DdlError::JobNotFound(job_id))?;
            if job.is_finished() {
                self.domain.ensure_version(job.schema_version)?;
                let error = job.error.clone().unwrap_or_else(JobError::cancelled);
                return match job.state {
                    JobState::Done => Ok(job),
                    JobState::RollbackDone => Err(DdlError::JobRolledBack { job_id, error }),
                    _ => Err(DdlError::JobCancelled { job_id, error }),
                };
            }
            thread::sleep(self.config.wait_poll_interval);
        }
    }

    /// `submit` followed by `wait`
    pub fn execute(&self, request: DdlRequest) -> Result<Job> {
        let job_id = self.submit(request)?;
        self.wait(job_id)
    }

    /// Ask the owner to cancel a job. Queued jobs end without touching the
    /// schema; running jobs are rolled back if they have not gone too far.
    pub fn cancel(&self, job_id: JobId) -> Result<()> {
        run_in_new_txn(self.store.as_ref(), self.config.retry_policy(), |txn| -> Result<()> {
            let mut m = Meta::new(txn);
            let Some(mut job) = m.active_job(job_id)? else {
                return match m.history_job(job_id)? {
                    Some(job) => Err(DdlError::CancelRejected { job_id, state: job.state }),
                    None => Err(DdlError::JobNotFound(job_id)),
                };
            };
            if !job.is_cancellable() {
                return Err(DdlError::CancelRejected { job_id, state: job.state });
            }
            job.cancel_requested = true;
            m.update_job(&job)
        })?;
        info!("[{}] requested cancellation of job {}", self.node_id, job_id);
        self.worker.notify();
        Ok(())
    }

    /// Latest global schema version in the store
    pub fn schema_version(&self) -> Result<SchemaVersion> {
        let mut txn = self.store.begin()?;
        let version = Meta::new(txn.as_mut()).schema_version();
        txn.rollback();
        version
    }

    /// Schema version at which `table_id` last changed, as seen by this node
    pub fn current_schema_version(&self, table_id: TableId) -> Result<SchemaVersion> {
        self.domain
            .info_schema()?
            .table_by_id(table_id)
            .map(|t| t.update_version)
            .ok_or_else(|| DdlError::TableNotFound(table_id.to_string()))
    }

    /// Active or finished job
    pub fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let mut txn = self.store.begin()?;
        let job = Meta::new(txn.as_mut()).job(job_id);
        txn.rollback();
        job
    }

    /// Active jobs in execution order
    pub fn jobs(&self) -> Result<Vec<Job>> {
        let mut txn = self.store.begin()?;
        let jobs = Meta::new(txn.as_mut()).active_jobs();
        txn.rollback();
        let mut jobs = jobs?;
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    /// Finished jobs, oldest first
    pub fn history(&self) -> Result<Vec<Job>> {
        let mut txn = self.store.begin()?;
        let jobs = Meta::new(txn.as_mut()).history_jobs();
        txn.rollback();
        jobs
    }

    /// DML handle for a public table in this node's current snapshot
    pub fn table(&self, schema: &str, name: &str) -> Result<TableData> {
        let info = self.resolve(|is| {
            is.table_by_name(schema, name)
                .ok_or_else(|| DdlError::TableNotFound(format!("{}.{}", schema, name)))
        })?;
        Ok(TableData::new(info, Arc::clone(&self.evaluator)))
    }
}

/// Schema id, table id and job arguments of a request, resolved against a
/// snapshot. Ids of objects being created are filled in at enqueue time.
fn job_target(is: &InfoSchema, request: &DdlRequest) -> Result<(i64, TableId, JobArgs)> {
    let public_schema = |name: &str| is.schema_by_name(name).ok_or_else(|| DdlError::SchemaNotFound(name.to_string()));
    let public_table = |schema: &str, table: &str| {
        is.table_by_name(schema, table)
            .ok_or_else(|| DdlError::TableNotFound(format!("{}.{}", schema, table)))
    };

    match request {
        DdlRequest::CreateSchema { name } => {
            if is.schema_by_name(name).is_some() {
                return Err(DdlError::SchemaExists(name.clone()));
            }
            Ok((0, SCHEMA_LANE, JobArgs::CreateSchema { name: name.clone() }))
        }
        DdlRequest::DropSchema { name } => {
            let db = public_schema(name)?;
            Ok((db.id, SCHEMA_LANE, JobArgs::DropSchema { name: db.name.clone() }))
        }
        DdlRequest::CreateTable { schema, table, columns } => {
            let db = public_schema(schema)?;
            let cols = columns.iter().map(ColumnDef::to_column_info).collect();
            let info = TableInfo::new(0, db.id, table.clone(), cols);
            Ok((db.id, 0, JobArgs::CreateTable { table: info }))
        }
        DdlRequest::DropTable { schema, table } => {
            let t = public_table(schema, table)?;
            Ok((t.schema_id, t.id, JobArgs::DropTable { name: t.name.clone() }))
        }
        DdlRequest::AlterTable { schema, table, op } => {
            let t = public_table(schema, table)?;
            let args = match op {
                AlterOp::AddColumn { column, position } => JobArgs::AddColumn {
                    column: column.to_column_info(),
                    position: position.clone(),
                },
                AlterOp::DropColumn { name } => JobArgs::DropColumn { name: name.clone() },
                AlterOp::AddIndex { name, columns, unique } => JobArgs::AddIndex {
                    name: name.clone(),
                    columns: columns.clone(),
                    unique: *unique,
                },
                AlterOp::DropIndex { name } => JobArgs::DropIndex { name: name.clone() },
            };
            Ok((t.schema_id, t.id, args))
        }
    }
}
