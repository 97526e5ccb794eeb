#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;

use bayun_ddl::common::{ColumnId, Handle, JobId, TableId};
use bayun_ddl::storage::codec;
use bayun_ddl::ddl::Callback;
use bayun_ddl::model::{Job, JobState};
use bayun_ddl::{
    AlterOp, ColumnDef, DataType, DataValue, Ddl, DdlConfig, DdlRequest, MemStore, SchemaState, Storage, Table,
    run_in_new_txn,
};

// Short lease and fast reloads so that every step publishes quickly
pub fn test_config() -> DdlConfig {
    let mut config = DdlConfig::with_lease(Duration::from_millis(500));
    config.owner_renew_interval = Duration::from_millis(50);
    config.schema_reload_interval = Duration::from_millis(20);
    config.backfill_batch_size = 4;
    config.retry_backoff = Duration::from_millis(2);
    config.max_retry_backoff = Duration::from_millis(50);
    config.max_txn_retries = 64;
    config.sync_poll_interval = Duration::from_millis(2);
    config.wait_poll_interval = Duration::from_millis(5);
    config
}

/// Several DDL nodes sharing one in-memory store. Node 0 starts first and
/// becomes the owner.
pub struct Cluster {
    pub store: MemStore,
    pub config: DdlConfig,
    pub nodes: Vec<Arc<Ddl>>,
}

impl Cluster {
    pub fn start(nodes: usize) -> Result<Self> {
        Self::start_with(nodes, test_config())
    }

    pub fn start_with(nodes: usize, config: DdlConfig) -> Result<Self> {
        let store = MemStore::new();
        let mut cluster = Cluster { store, config, nodes: Vec::new() };
        for _ in 0..nodes {
            cluster.add_node()?;
        }
        Ok(cluster)
    }

    /// A node over the shared store that has not been started
    pub fn new_node(&self) -> Result<Arc<Ddl>> {
        let id = format!("node-{}", self.nodes.len() + 1);
        Ok(Arc::new(Ddl::new(id, Arc::new(self.store.clone()), self.config.clone())?))
    }

    pub fn add_node(&mut self) -> Result<Arc<Ddl>> {
        let ddl = self.new_node()?;
        ddl.start()?;
        self.nodes.push(ddl.clone());
        Ok(ddl)
    }

    pub fn node(&self, i: usize) -> &Ddl {
        &self.nodes[i]
    }

    /// The node currently holding the owner lease
    pub fn wait_for_owner(&self, timeout: Duration) -> Result<&Ddl> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(owner) = self.nodes.iter().find(|n| n.is_owner()) {
                return Ok(owner.as_ref());
            }
            if Instant::now() > deadline {
                bail!("no node became DDL owner within {:?}", timeout);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn set_callback(&self, callback: Arc<dyn Callback>) {
        for node in &self.nodes {
            node.set_callback(callback.clone());
        }
    }

    pub fn close(&self) {
        for node in &self.nodes {
            node.close();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create schema `test` with table `t1(c1, c2, c3)` holding `rows` rows
/// `(i, 10i, 100i)`
pub fn setup_t1(ddl: &Ddl, rows: i64) -> Result<()> {
    ddl.execute(DdlRequest::CreateSchema { name: "test".to_string() })?;
    ddl.execute(DdlRequest::CreateTable {
        schema: "test".to_string(),
        table: "t1".to_string(),
        columns: ["c1", "c2", "c3"].iter().map(|n| ColumnDef::new(*n, DataType::Integer)).collect(),
    })?;
    let t1 = ddl.table("test", "t1")?;
    for i in 0..rows {
        insert(ddl, &t1, &[DataValue::Integer(i), DataValue::Integer(10 * i), DataValue::Integer(100 * i)])?;
    }
    Ok(())
}

pub fn insert(ddl: &Ddl, table: &Table, row: &[DataValue]) -> Result<Handle> {
    Ok(run_in_new_txn(ddl.store().as_ref(), ddl.config().retry_policy(), |txn| {
        table.add_record(txn, row)
    })?)
}

/// Public values of every row, in handle order
pub fn select_all(ddl: &Ddl, schema: &str, table: &str) -> Result<Vec<(Handle, Vec<DataValue>)>> {
    let t = ddl.table(schema, table)?;
    let mut txn = ddl.store().begin()?;
    let rows = t.rows(txn.as_mut())?;
    txn.rollback();
    Ok(rows)
}

pub fn column_names(ddl: &Ddl, schema: &str, table: &str) -> Result<Vec<String>> {
    Ok(ddl.table(schema, table)?.cols().iter().map(|c| c.name.clone()).collect())
}

/// Every stored column value of a table as (handle, column id, whether the
/// row marker still exists)
pub fn stored_values(ddl: &Ddl, table_id: TableId) -> Result<Vec<(Handle, ColumnId, bool)>> {
    let mut prefix = codec::table_prefix(table_id);
    prefix.extend_from_slice(codec::RECORD_SEP);
    let mut txn = ddl.store().begin()?;
    let mut values = Vec::new();
    for (key, _) in txn.scan(&prefix, &codec::prefix_end(&prefix), usize::MAX)? {
        let rest = &key[prefix.len()..];
        let handle = codec::decode_i64(rest).context("column key without handle")?;
        let column = rest.get(8..).and_then(codec::decode_i64).context("column key without column id")?;
        let live = txn.get(&codec::row_marker_key(table_id, handle))?.is_some();
        values.push((handle, column, live));
    }
    txn.rollback();
    Ok(values)
}

/// ALTER TABLE on a table of schema `test`
pub fn alter(table: &str, op: AlterOp) -> DdlRequest {
    DdlRequest::AlterTable { schema: "test".to_string(), table: table.to_string(), op }
}

/// One observed job change
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub job_id: JobId,
    pub old_state: SchemaState,
    pub new_state: SchemaState,
    pub job_state: JobState,
    pub has_error: bool,
}

/// Records every job change and run-before notification
#[derive(Default)]
pub struct Recorder {
    pub transitions: Mutex<Vec<Transition>>,
    pub runs: Mutex<Vec<JobId>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transitions_of(&self, job_id: JobId) -> Vec<Transition> {
        self.transitions.lock().iter().filter(|t| t.job_id == job_id).cloned().collect()
    }

    /// Schema states a job passed through, without repeats
    pub fn states_of(&self, job_id: JobId) -> Vec<SchemaState> {
        let mut states: Vec<SchemaState> = Vec::new();
        for t in self.transitions_of(job_id) {
            if states.last() != Some(&t.new_state) {
                states.push(t.new_state);
            }
        }
        states
    }
}

impl Callback for Recorder {
    fn on_job_updated(&self, job: &Job, old_state: SchemaState) {
        self.transitions.lock().push(Transition {
            job_id: job.id,
            old_state,
            new_state: job.schema_state,
            job_state: job.state,
            has_error: job.error.is_some(),
        });
    }

    fn on_job_run_before(&self, job: &Job) {
        self.runs.lock().push(job.id);
    }
}
