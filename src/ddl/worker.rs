// DDL Owner Worker
//
// Every node runs a worker, but only the lease holder does any work. The
// owner takes the oldest active job, runs one state-machine step and
// commits it together with a schema version bump in a single transaction,
// then waits for the cluster to load that version before the next step.
// Backfill runs between steps, outside the step transaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::catalog::Domain;
use crate::common::{JobId, SchemaVersion};
use crate::config::DdlConfig;
use crate::ddl::callback::Callback;
use crate::ddl::column::{on_add_column, on_drop_column};
use crate::ddl::error::{DdlError, Result};
use crate::ddl::index::{on_add_index, on_drop_index};
use crate::ddl::owner::OwnerManager;
use crate::ddl::reorg::{Reorg, ReorgTask};
use crate::ddl::schema::{on_create_schema, on_drop_schema};
use crate::ddl::step::Step;
use crate::ddl::syncer::SchemaSyncer;
use crate::ddl::table::{on_create_table, on_drop_table};
use crate::evaluator::Evaluator;
use crate::meta::Meta;
use crate::model::{DbInfo, Job, JobArgs, JobError, JobState, SchemaDiff, SchemaState, TableInfo};
use crate::storage::{RetryPolicy, Storage, Transaction, run_in_new_txn};

/// Objects the worker persists on behalf of a step
trait SchemaObject: Sized {
    fn stamp(&mut self, _version: SchemaVersion) {}
    fn save(&self, m: &mut Meta) -> Result<()>;
    fn remove(m: &mut Meta, job: &Job) -> Result<()>;
}

impl SchemaObject for DbInfo {
    fn save(&self, m: &mut Meta) -> Result<()> {
        if m.database(self.id)?.is_some() {
            m.update_database(self)
        } else {
            m.create_database(self)
        }
    }

    fn remove(m: &mut Meta, job: &Job) -> Result<()> {
        m.drop_database(job.schema_id)
    }
}

impl SchemaObject for TableInfo {
    fn stamp(&mut self, version: SchemaVersion) {
        self.update_version = version;
    }

    fn save(&self, m: &mut Meta) -> Result<()> {
        if m.table(self.schema_id, self.id)?.is_some() {
            m.update_table(self)
        } else {
            m.create_table(self)
        }
    }

    fn remove(m: &mut Meta, job: &Job) -> Result<()> {
        m.drop_table(job.schema_id, job.table_id)
    }
}

/// Handler output, before it is applied
enum Change {
    Schema(Step<DbInfo>),
    Table(Step<TableInfo>),
}

/// What one committed owner transaction did
struct StepOutcome {
    job: Job,
    old_state: SchemaState,
    /// Schema version published by the step, if any
    version: Option<SchemaVersion>,
    reorg: Option<ReorgTask>,
    changed: bool,
    /// Error recorded on a job that can only move forward; retried later
    failed: Option<DdlError>,
}

pub struct Worker {
    store: Arc<dyn Storage>,
    config: DdlConfig,
    owner: Arc<OwnerManager>,
    domain: Arc<Domain>,
    syncer: SchemaSyncer,
    evaluator: Arc<dyn Evaluator>,
    callback: RwLock<Arc<dyn Callback>>,
    /// Highest version this node has waited on as owner
    synced_version: AtomicI64,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
    closed: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Storage>,
        config: DdlConfig,
        owner: Arc<OwnerManager>,
        domain: Arc<Domain>,
        evaluator: Arc<dyn Evaluator>,
        callback: Arc<dyn Callback>,
    ) -> Self {
        let (notify_tx, notify_rx) = channel::bounded(1);
        Self {
            syncer: SchemaSyncer::new(Arc::clone(&store), config.clone()),
            store,
            config,
            owner,
            domain,
            evaluator,
            callback: RwLock::new(callback),
            synced_version: AtomicI64::new(0),
            notify_tx,
            notify_rx,
            closed: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: Arc<dyn Callback>) {
        *self.callback.write() = callback;
    }

    fn callback(&self) -> Arc<dyn Callback> {
        self.callback.read().clone()
    }

    /// Wake the worker up, e.g. after a local submission
    pub fn notify(&self) {
        let _ = self.notify_tx.try_send(());
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("ddl-worker-{}", self.owner.node_id()))
            .spawn(move || worker.run())
            .map_err(|e| DdlError::Internal(format!("failed to spawn DDL worker: {}", e)))?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the loop. A step in flight either commits or is abandoned to the
    /// next owner.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let idle = self.config.owner_renew_interval;
        let mut backoff: Option<Duration> = None;
        while !self.closed.load(Ordering::SeqCst) {
            let timeout = backoff.unwrap_or(idle);
            crossbeam::select! {
                recv(self.notify_rx) -> _ => {},
                recv(channel::after(timeout)) -> _ => {},
            }
            if self.closed.load(Ordering::SeqCst) || !self.owner.is_owner() {
                continue;
            }

            while !self.closed.load(Ordering::SeqCst) {
                match self.handle_next_job() {
                    Ok(true) => backoff = None,
                    Ok(false) => {
                        backoff = None;
                        break;
                    }
                    Err(e) => {
                        let next = backoff
                            .map(|b| (b * 2).min(self.config.max_retry_backoff))
                            .unwrap_or(self.config.retry_backoff);
                        if e.is_retryable() {
                            warn!("[{}] DDL step failed, retrying in {:?}: {}", self.owner.node_id(), next, e);
                        } else {
                            error!("[{}] DDL step failed, retrying in {:?}: {}", self.owner.node_id(), next, e);
                        }
                        backoff = Some(next);
                        break;
                    }
                }
            }
        }
        debug!("[{}] DDL worker stopped", self.owner.node_id());
    }

    /// Run one step of the oldest job. Returns false when the queue is empty.
    pub(crate) fn handle_next_job(&self) -> Result<bool> {
        let Some(head) = self.peek_first_job()? else {
            return Ok(false);
        };

        // A previous owner may have died between committing a step and
        // waiting for it to spread.
        if head.schema_version > self.synced_version.load(Ordering::SeqCst) {
            self.wait_synced(head.schema_version)?;
        }

        self.callback().on_job_run_before(&head);
        let outcome = self.owner_txn(|txn| self.run_step(txn))?;
        let Some(outcome) = outcome else {
            return Ok(false);
        };

        if let Some(version) = outcome.version {
            info!(
                "[{}] committed schema version {}: {}",
                self.owner.node_id(),
                version,
                outcome.job
            );
            if let Err(e) = self.domain.reload() {
                warn!("[{}] schema reload after version {} failed: {}", self.owner.node_id(), version, e);
            }
            self.wait_synced(version)?;
        }
        if outcome.changed {
            self.callback().on_job_updated(&outcome.job, outcome.old_state);
        }
        if let Some(e) = outcome.failed {
            return Err(e);
        }
        if outcome.job.is_finished() {
            info!("[{}] finished DDL job: {}", self.owner.node_id(), outcome.job);
        }
        if let Some(task) = outcome.reorg {
            self.run_reorg(&outcome.job, &task)?;
        }
        Ok(true)
    }

    fn peek_first_job(&self) -> Result<Option<Job>> {
        let mut txn = self.store.begin()?;
        let job = Meta::new(txn.as_mut()).first_job();
        txn.rollback();
        job
    }

    fn wait_synced(&self, version: SchemaVersion) -> Result<()> {
        self.syncer.wait_version_synced(version)?;
        self.synced_version.fetch_max(version, Ordering::SeqCst);
        Ok(())
    }

    /// Single attempt. Retries happen in the worker loop.
    fn owner_txn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnMut(&mut dyn Transaction) -> Result<T>,
    {
        let policy = RetryPolicy { max_retries: 0, ..self.config.retry_policy() };
        run_in_new_txn(self.store.as_ref(), policy, f)
    }

    fn run_step(&self, txn: &mut dyn Transaction) -> Result<Option<StepOutcome>> {
        let mut m = Meta::new(txn);
        self.owner.check_lease(&mut m)?;
        let Some(mut job) = m.first_job()? else {
            return Ok(None);
        };
        let old_state = job.schema_state;

        if job.cancel_requested {
            job.cancel_requested = false;
            let changed = match job.state {
                JobState::Pending => {
                    info!("[{}] cancelled queued job {}", self.owner.node_id(), job.id);
                    job.state = JobState::Cancelled;
                    job.error = Some(JobError::cancelled());
                    m.finish_job(&job)?;
                    true
                }
                JobState::Running if job.is_cancellable() => {
                    info!("[{}] rolling back job {} on request", self.owner.node_id(), job.id);
                    job.state = JobState::Cancelling;
                    job.error = Some(JobError::cancelled());
                    job.reorg_done = false;
                    m.clear_reorg(job.id)?;
                    m.update_job(&job)?;
                    true
                }
                _ => {
                    warn!("[{}] ignoring cancel request for job {}", self.owner.node_id(), job);
                    m.update_job(&job)?;
                    false
                }
            };
            return Ok(Some(StepOutcome { job, old_state, version: None, reorg: None, changed, failed: None }));
        }

        let started = job.state == JobState::Pending;
        if started {
            job.state = JobState::Running;
        }
        let change = match self.run_handler(&mut m, &job) {
            Ok(change) => change,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) if job.state == JobState::Cancelling => {
                error!("[{}] rollback of job {} failed: {}", self.owner.node_id(), job.id, e);
                return Err(e);
            }
            Err(e) if job.schema_version != 0 && !job.can_roll_back() => {
                warn!(
                    "[{}] job {} failed past the point of no return, retrying: {}",
                    self.owner.node_id(),
                    job.id,
                    e
                );
                job.error = Some(e.to_job_error());
                m.update_job(&job)?;
                return Ok(Some(StepOutcome { job, old_state, version: None, reorg: None, changed: false, failed: Some(e) }));
            }
            Err(e) => {
                job.error = Some(e.to_job_error());
                if job.schema_version == 0 {
                    // nothing was published for this job yet
                    warn!("[{}] job {} rejected: {}", self.owner.node_id(), job.id, e);
                    job.state = JobState::Cancelled;
                    m.finish_job(&job)?;
                } else {
                    error!("[{}] job {} failed, rolling back: {}", self.owner.node_id(), job.id, e);
                    job.state = JobState::Cancelling;
                    job.reorg_done = false;
                    m.clear_reorg(job.id)?;
                    m.update_job(&job)?;
                }
                return Ok(Some(StepOutcome { job, old_state, version: None, reorg: None, changed: true, failed: None }));
            }
        };

        if job.state == JobState::Running {
            job.error = None;
        }
        let (version, reorg) = match change {
            Change::Schema(step) => self.apply_step(&mut m, &mut job, step)?,
            Change::Table(step) => self.apply_step(&mut m, &mut job, step)?,
        };
        if started && version.is_none() {
            m.update_job(&job)?;
        }
        Ok(Some(StepOutcome { job, old_state, version, reorg, changed: version.is_some() || started, failed: None }))
    }

    /// Read the job's target and ask its handler for the next step. Reads
    /// only; nothing is written before the step is known to be valid.
    fn run_handler(&self, m: &mut Meta, job: &Job) -> Result<Change> {
        let change = match &job.args {
            JobArgs::CreateSchema { name } => {
                let taken = m
                    .list_databases()?
                    .iter()
                    .any(|db| db.id != job.schema_id && db.name.eq_ignore_ascii_case(name));
                Change::Schema(on_create_schema(taken, job)?)
            }
            JobArgs::DropSchema { name } => {
                let db = m.database(job.schema_id)?.ok_or_else(|| DdlError::SchemaNotFound(name.clone()))?;
                let tables = m.list_tables(job.schema_id)?.len();
                Change::Schema(on_drop_schema(db, tables, job)?)
            }
            JobArgs::CreateTable { table } => {
                let db = m.database(job.schema_id)?;
                let taken = m
                    .list_tables(job.schema_id)?
                    .iter()
                    .any(|t| t.id != job.table_id && t.name.eq_ignore_ascii_case(&table.name));
                Change::Table(on_create_table(db.as_ref(), taken, job, self.evaluator.as_ref())?)
            }
            args => {
                let table = m
                    .table(job.schema_id, job.table_id)?
                    .ok_or_else(|| DdlError::TableNotFound(args.object_name().to_string()))?;
                let step = match args {
                    JobArgs::DropTable { .. } => on_drop_table(table, job)?,
                    JobArgs::AddColumn { .. } => on_add_column(table, job, self.evaluator.as_ref())?,
                    JobArgs::DropColumn { .. } => on_drop_column(table, job)?,
                    JobArgs::AddIndex { .. } => on_add_index(table, job)?,
                    JobArgs::DropIndex { .. } => on_drop_index(table, job)?,
                    _ => return Err(DdlError::Internal(format!("unhandled job {}", job))),
                };
                Change::Table(step)
            }
        };
        Ok(change)
    }

    fn apply_step<T: SchemaObject>(
        &self,
        m: &mut Meta,
        job: &mut Job,
        step: Step<T>,
    ) -> Result<(Option<SchemaVersion>, Option<ReorgTask>)> {
        match step {
            Step::Reorganize(task) => Ok((None, Some(task))),
            Step::Advance { mut obj, state } => {
                let version = self.publish(m, job)?;
                obj.stamp(version);
                obj.save(m)?;
                job.schema_state = state;
                job.schema_version = version;
                job.reorg_done = false;
                m.update_job(job)?;
                Ok((Some(version), None))
            }
            Step::Finish { obj, state, job_state } => {
                let version = self.publish(m, job)?;
                match obj {
                    Some(mut obj) => {
                        obj.stamp(version);
                        obj.save(m)?;
                    }
                    None => T::remove(m, job)?,
                }
                job.schema_state = state;
                job.schema_version = version;
                job.state = job_state;
                job.reorg_done = false;
                m.clear_reorg(job.id)?;
                m.finish_job(job)?;
                Ok((Some(version), None))
            }
        }
    }

    /// Bump the schema version and record what it changed
    fn publish(&self, m: &mut Meta, job: &Job) -> Result<SchemaVersion> {
        let version = m.gen_schema_version()?;
        m.set_schema_diff(&SchemaDiff {
            version,
            job_id: job.id,
            job_type: job.job_type(),
            schema_id: job.schema_id,
            table_id: job.table_id,
        })?;
        Ok(version)
    }

    fn run_reorg(&self, job: &Job, task: &ReorgTask) -> Result<()> {
        let callback = self.callback();
        let reorg = Reorg {
            store: self.store.as_ref(),
            config: &self.config,
            evaluator: self.evaluator.as_ref(),
            guard: self.owner.as_ref(),
            callback: Some(callback.as_ref()),
        };
        info!("[{}] starting backfill for job {}", self.owner.node_id(), job.id);
        match reorg.run(job, task) {
            Ok(processed) => {
                let updated = self.owner_txn(|txn| {
                    let mut m = Meta::new(txn);
                    self.owner.check_lease(&mut m)?;
                    let mut current = active_job(&mut m, job.id)?;
                    current.row_count += reorg_progress(&mut m, job.id)?;
                    current.reorg_done = true;
                    if current.state == JobState::Running {
                        current.error = None;
                    }
                    m.clear_reorg(job.id)?;
                    m.update_job(&current)?;
                    Ok(current)
                })?;
                info!(
                    "[{}] backfill for job {} done, {} keys in this run",
                    self.owner.node_id(),
                    job.id,
                    processed
                );
                self.callback().on_job_updated(&updated, updated.schema_state);
                Ok(())
            }
            Err(e) if e.is_retryable() || job.state == JobState::Cancelling => Err(e),
            Err(e) if !job.can_roll_back() => {
                warn!(
                    "[{}] backfill for job {} failed past the point of no return, retrying: {}",
                    self.owner.node_id(),
                    job.id,
                    e
                );
                self.owner_txn(|txn| {
                    let mut m = Meta::new(txn);
                    self.owner.check_lease(&mut m)?;
                    let mut current = active_job(&mut m, job.id)?;
                    current.error = Some(e.to_job_error());
                    m.update_job(&current)
                })?;
                Err(e)
            }
            Err(e) => {
                error!("[{}] backfill for job {} failed, rolling back: {}", self.owner.node_id(), job.id, e);
                let updated = self.owner_txn(|txn| {
                    let mut m = Meta::new(txn);
                    self.owner.check_lease(&mut m)?;
                    let mut current = active_job(&mut m, job.id)?;
                    current.state = JobState::Cancelling;
                    current.error = Some(e.to_job_error());
                    current.reorg_done = false;
                    m.clear_reorg(job.id)?;
                    m.update_job(&current)?;
                    Ok(current)
                })?;
                self.callback().on_job_updated(&updated, updated.schema_state);
                Ok(())
            }
        }
    }
}

fn active_job(m: &mut Meta, job_id: JobId) -> Result<Job> {
    m.active_job(job_id)?.ok_or(DdlError::JobNotFound(job_id))
}

/// Keys processed across every range of the job's current backfill
fn reorg_progress(m: &mut Meta, job_id: JobId) -> Result<u64> {
    let ranges = m.reorg_plan(job_id)?.map(|p| p.len()).unwrap_or(0);
    let mut total = 0;
    for range in 0..ranges {
        if let Some(ckpt) = m.reorg_checkpoint(job_id, range)? {
            total += ckpt.processed;
        }
    }
    Ok(total)
}
