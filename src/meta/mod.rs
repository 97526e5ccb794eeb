//! Meta Module
//!
//! Schema Store and Job Log on top of one KV transaction. Everything the
//! cluster agrees on lives here: the global id counter, the schema version
//! and its diffs, database and table descriptions, the job queue and job
//! history, the owner lease, node heartbeats, backfill progress and per-table
//! row id counters.
//!
//! Key layout (all under the `m` prefix):
//!
//!   mNextGlobalID                      i64
//!   mSchemaVersion                     i64
//!   mDiff:{version}                    SchemaDiff
//!   mDB:{schema}                       DbInfo
//!   mTable:{schema}{table}             TableInfo
//!   mJobQueue:{lane}{job}              Job (active)
//!   mJobIdx:{job}                      lane of an active job
//!   mJobHistory:{job}                  Job (terminal)
//!   mDDLOwner                          Lease
//!   mNode:{node}                       NodeStatus
//!   mReorgPlan:{job}                   Vec<ReorgRange>
//!   mReorgCkpt:{job}{range}            ReorgCheckpoint
//!   mAutoID:{table}                    i64

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::{Handle, JobId, SchemaId, SchemaVersion, TableId};
use crate::ddl::error::{DdlError, Result};
use crate::model::{DbInfo, Job, Lease, NodeStatus, ReorgCheckpoint, ReorgRange, SchemaDiff, TableInfo};
use crate::storage::Transaction;
use crate::storage::codec::{decode_i64, encode_i64, prefix_end};

const NEXT_GLOBAL_ID_KEY: &[u8] = b"mNextGlobalID";
const SCHEMA_VERSION_KEY: &[u8] = b"mSchemaVersion";
const OWNER_LEASE_KEY: &[u8] = b"mDDLOwner";
const DIFF_PREFIX: &[u8] = b"mDiff:";
const DB_PREFIX: &[u8] = b"mDB:";
const TABLE_PREFIX: &[u8] = b"mTable:";
const JOB_QUEUE_PREFIX: &[u8] = b"mJobQueue:";
const JOB_INDEX_PREFIX: &[u8] = b"mJobIdx:";
const JOB_HISTORY_PREFIX: &[u8] = b"mJobHistory:";
const NODE_PREFIX: &[u8] = b"mNode:";
const REORG_PLAN_PREFIX: &[u8] = b"mReorgPlan:";
const REORG_CKPT_PREFIX: &[u8] = b"mReorgCkpt:";
const AUTO_ID_PREFIX: &[u8] = b"mAutoID:";

fn key_with(prefix: &[u8], ids: &[i64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + ids.len() * 8);
    key.extend_from_slice(prefix);
    for id in ids {
        encode_i64(&mut key, *id);
    }
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Typed access to the meta keys through one transaction
pub struct Meta<'a> {
    txn: &'a mut dyn Transaction,
}

impl<'a> Meta<'a> {
    pub fn new(txn: &'a mut dyn Transaction) -> Self {
        Self { txn }
    }

    /// Raw transaction, for callers that also touch row data
    pub fn txn(&mut self) -> &mut dyn Transaction {
        &mut *self.txn
    }

    fn get_value<T: DeserializeOwned>(&mut self, key: &[u8]) -> Result<Option<T>> {
        match self.txn.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_value<T: Serialize>(&mut self, key: &[u8], value: &T) -> Result<()> {
        let bytes = encode(value)?;
        self.txn.set(key, &bytes)?;
        Ok(())
    }

    fn scan_values<T: DeserializeOwned>(&mut self, prefix: &[u8], limit: usize) -> Result<Vec<T>> {
        let end = prefix_end(prefix);
        self.txn
            .scan(prefix, &end, limit)?
            .iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    fn get_i64(&mut self, key: &[u8]) -> Result<i64> {
        match self.txn.get(key)? {
            Some(bytes) if bytes.len() == 8 => Ok(BigEndian::read_i64(&bytes)),
            Some(_) => Err(DdlError::Codec(format!("bad counter at {}", hex::encode(key)))),
            None => Ok(0),
        }
    }

    /// Add `step` to the counter at `key` and return the new value
    fn inc(&mut self, key: &[u8], step: i64) -> Result<i64> {
        let next = self.get_i64(key)? + step;
        let mut bytes = [0u8; 8];
        BigEndian::write_i64(&mut bytes, next);
        self.txn.set(key, &bytes)?;
        Ok(next)
    }

    // ---- ids and versions ----

    pub fn gen_global_id(&mut self) -> Result<i64> {
        self.inc(NEXT_GLOBAL_ID_KEY, 1)
    }

    pub fn gen_global_ids(&mut self, n: usize) -> Result<Vec<i64>> {
        let last = self.inc(NEXT_GLOBAL_ID_KEY, n as i64)?;
        Ok(((last - n as i64 + 1)..=last).collect())
    }

    pub fn schema_version(&mut self) -> Result<SchemaVersion> {
        self.get_i64(SCHEMA_VERSION_KEY)
    }

    pub fn gen_schema_version(&mut self) -> Result<SchemaVersion> {
        self.inc(SCHEMA_VERSION_KEY, 1)
    }

    pub fn set_schema_diff(&mut self, diff: &SchemaDiff) -> Result<()> {
        self.set_value(&key_with(DIFF_PREFIX, &[diff.version]), diff)
    }

    pub fn schema_diff(&mut self, version: SchemaVersion) -> Result<Option<SchemaDiff>> {
        self.get_value(&key_with(DIFF_PREFIX, &[version]))
    }

    // ---- databases ----

    pub fn create_database(&mut self, db: &DbInfo) -> Result<()> {
        let key = key_with(DB_PREFIX, &[db.id]);
        if self.txn.get(&key)?.is_some() {
            return Err(DdlError::SchemaExists(db.name.clone()));
        }
        self.set_value(&key, db)
    }

    pub fn update_database(&mut self, db: &DbInfo) -> Result<()> {
        let key = key_with(DB_PREFIX, &[db.id]);
        if self.txn.get(&key)?.is_none() {
            return Err(DdlError::SchemaNotFound(db.name.clone()));
        }
        self.set_value(&key, db)
    }

    pub fn drop_database(&mut self, schema_id: SchemaId) -> Result<()> {
        self.txn.delete(&key_with(DB_PREFIX, &[schema_id]))?;
        Ok(())
    }

    pub fn database(&mut self, schema_id: SchemaId) -> Result<Option<DbInfo>> {
        self.get_value(&key_with(DB_PREFIX, &[schema_id]))
    }

    pub fn list_databases(&mut self) -> Result<Vec<DbInfo>> {
        self.scan_values(DB_PREFIX, usize::MAX)
    }

    // ---- tables ----

    pub fn create_table(&mut self, table: &TableInfo) -> Result<()> {
        if self.database(table.schema_id)?.is_none() {
            return Err(DdlError::SchemaNotFound(table.schema_id.to_string()));
        }
        let key = key_with(TABLE_PREFIX, &[table.schema_id, table.id]);
        if self.txn.get(&key)?.is_some() {
            return Err(DdlError::TableExists(table.name.clone()));
        }
        self.set_value(&key, table)
    }

    pub fn update_table(&mut self, table: &TableInfo) -> Result<()> {
        let key = key_with(TABLE_PREFIX, &[table.schema_id, table.id]);
        if self.txn.get(&key)?.is_none() {
            return Err(DdlError::TableNotFound(table.name.clone()));
        }
        self.set_value(&key, table)
    }

    pub fn drop_table(&mut self, schema_id: SchemaId, table_id: TableId) -> Result<()> {
        self.txn.delete(&key_with(TABLE_PREFIX, &[schema_id, table_id]))?;
        self.txn.delete(&key_with(AUTO_ID_PREFIX, &[table_id]))?;
        Ok(())
    }

    pub fn table(&mut self, schema_id: SchemaId, table_id: TableId) -> Result<Option<TableInfo>> {
        self.get_value(&key_with(TABLE_PREFIX, &[schema_id, table_id]))
    }

    pub fn list_tables(&mut self, schema_id: SchemaId) -> Result<Vec<TableInfo>> {
        self.scan_values(&key_with(TABLE_PREFIX, &[schema_id]), usize::MAX)
    }

    // ---- job log ----

    fn queue_key(lane: TableId, job_id: JobId) -> Vec<u8> {
        key_with(JOB_QUEUE_PREFIX, &[lane, job_id])
    }

    fn lane_of(&mut self, job_id: JobId) -> Result<Option<TableId>> {
        match self.txn.get(&key_with(JOB_INDEX_PREFIX, &[job_id]))? {
            Some(bytes) => decode_i64(&bytes)
                .map(Some)
                .ok_or_else(|| DdlError::Codec(format!("bad job index entry for job {}", job_id))),
            None => Ok(None),
        }
    }

    /// Append a job to its table's lane
    pub fn enqueue_job(&mut self, job: &Job) -> Result<()> {
        let mut lane = Vec::with_capacity(8);
        encode_i64(&mut lane, job.table_id);
        self.txn.set(&key_with(JOB_INDEX_PREFIX, &[job.id]), &lane)?;
        self.set_value(&Self::queue_key(job.table_id, job.id), job)
    }

    pub fn update_job(&mut self, job: &Job) -> Result<()> {
        let key = Self::queue_key(job.table_id, job.id);
        if self.txn.get(&key)?.is_none() {
            return Err(DdlError::JobNotFound(job.id));
        }
        self.set_value(&key, job)
    }

    pub fn active_job(&mut self, job_id: JobId) -> Result<Option<Job>> {
        match self.lane_of(job_id)? {
            Some(lane) => self.get_value(&Self::queue_key(lane, job_id)),
            None => Ok(None),
        }
    }

    /// The oldest active job. Job ids grow with submission order, so this is
    /// always at the head of its own lane.
    pub fn first_job(&mut self) -> Result<Option<Job>> {
        let end = prefix_end(JOB_INDEX_PREFIX);
        let first = self.txn.scan(JOB_INDEX_PREFIX, &end, 1)?;
        let Some((key, _)) = first.into_iter().next() else {
            return Ok(None);
        };
        let job_id = decode_i64(&key[JOB_INDEX_PREFIX.len()..])
            .ok_or_else(|| DdlError::Codec("bad job index key".to_string()))?;
        self.active_job(job_id)
    }

    /// Active jobs of one lane in submission order
    pub fn lane_jobs(&mut self, lane: TableId) -> Result<Vec<Job>> {
        self.scan_values(&key_with(JOB_QUEUE_PREFIX, &[lane]), usize::MAX)
    }

    /// All active jobs ordered by lane, then submission order
    pub fn active_jobs(&mut self) -> Result<Vec<Job>> {
        self.scan_values(JOB_QUEUE_PREFIX, usize::MAX)
    }

    /// Move a terminal job from the queue to the history table
    pub fn finish_job(&mut self, job: &Job) -> Result<()> {
        self.txn.delete(&Self::queue_key(job.table_id, job.id))?;
        self.txn.delete(&key_with(JOB_INDEX_PREFIX, &[job.id]))?;
        self.set_value(&key_with(JOB_HISTORY_PREFIX, &[job.id]), job)
    }

    pub fn history_job(&mut self, job_id: JobId) -> Result<Option<Job>> {
        self.get_value(&key_with(JOB_HISTORY_PREFIX, &[job_id]))
    }

    pub fn history_jobs(&mut self) -> Result<Vec<Job>> {
        self.scan_values(JOB_HISTORY_PREFIX, usize::MAX)
    }

    /// Active or finished job by id
    pub fn job(&mut self, job_id: JobId) -> Result<Option<Job>> {
        match self.active_job(job_id)? {
            Some(job) => Ok(Some(job)),
            None => self.history_job(job_id),
        }
    }

    // ---- owner lease and node heartbeats ----

    pub fn owner_lease(&mut self) -> Result<Option<Lease>> {
        self.get_value(OWNER_LEASE_KEY)
    }

    pub fn set_owner_lease(&mut self, lease: &Lease) -> Result<()> {
        self.set_value(OWNER_LEASE_KEY, lease)
    }

    pub fn clear_owner_lease(&mut self) -> Result<()> {
        self.txn.delete(OWNER_LEASE_KEY)?;
        Ok(())
    }

    fn node_key(node_id: &str) -> Vec<u8> {
        let mut key = NODE_PREFIX.to_vec();
        key.extend_from_slice(node_id.as_bytes());
        key
    }

    pub fn set_node_status(&mut self, status: &NodeStatus) -> Result<()> {
        self.set_value(&Self::node_key(&status.node_id), status)
    }

    pub fn remove_node_status(&mut self, node_id: &str) -> Result<()> {
        self.txn.delete(&Self::node_key(node_id))?;
        Ok(())
    }

    pub fn node_statuses(&mut self) -> Result<Vec<NodeStatus>> {
        self.scan_values(NODE_PREFIX, usize::MAX)
    }

    // ---- backfill progress ----

    pub fn set_reorg_plan(&mut self, job_id: JobId, ranges: &[ReorgRange]) -> Result<()> {
        self.set_value(&key_with(REORG_PLAN_PREFIX, &[job_id]), &ranges)
    }

    pub fn reorg_plan(&mut self, job_id: JobId) -> Result<Option<Vec<ReorgRange>>> {
        self.get_value(&key_with(REORG_PLAN_PREFIX, &[job_id]))
    }

    pub fn set_reorg_checkpoint(&mut self, job_id: JobId, range: usize, ckpt: &ReorgCheckpoint) -> Result<()> {
        self.set_value(&key_with(REORG_CKPT_PREFIX, &[job_id, range as i64]), ckpt)
    }

    pub fn reorg_checkpoint(&mut self, job_id: JobId, range: usize) -> Result<Option<ReorgCheckpoint>> {
        self.get_value(&key_with(REORG_CKPT_PREFIX, &[job_id, range as i64]))
    }

    /// Forget the plan and every checkpoint of a job
    pub fn clear_reorg(&mut self, job_id: JobId) -> Result<()> {
        let ranges = self.reorg_plan(job_id)?.map(|p| p.len()).unwrap_or(0);
        for range in 0..ranges {
            self.txn.delete(&key_with(REORG_CKPT_PREFIX, &[job_id, range as i64]))?;
        }
        self.txn.delete(&key_with(REORG_PLAN_PREFIX, &[job_id]))?;
        Ok(())
    }

    // ---- row ids ----

    /// Reserve `n` row handles and return the last one
    pub fn gen_auto_id(&mut self, table_id: TableId, n: i64) -> Result<Handle> {
        self.inc(&key_with(AUTO_ID_PREFIX, &[table_id]), n)
    }

    /// Largest row handle handed out so far
    pub fn auto_id(&mut self, table_id: TableId) -> Result<Handle> {
        self.get_i64(&key_with(AUTO_ID_PREFIX, &[table_id]))
    }
}
