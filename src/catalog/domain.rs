// Per-node schema cache
//
// A `Domain` keeps the latest `InfoSchema` this node has loaded, reloads it
// on a fixed interval and after every local DDL commit, and reports the
// loaded version to the cluster through its `NodeStatus` heartbeat. If the
// node has not reloaded successfully for a whole lease it stops handing out
// snapshots until it catches up.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Sender};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use super::info_schema::InfoSchema;
use crate::common::clock::expiry_after;
use crate::common::{NodeId, SchemaVersion};
use crate::config::DdlConfig;
use crate::ddl::error::{DdlError, Result};
use crate::meta::Meta;
use crate::model::{JobType, NodeStatus};
use crate::storage::{Storage, run_in_new_txn};

/// Reload from scratch instead of replaying more diffs than this
const MAX_DIFF_REPLAY: i64 = 100;

pub struct Domain {
    node_id: NodeId,
    store: Arc<dyn Storage>,
    config: DdlConfig,
    info: RwLock<Arc<InfoSchema>>,
    /// Time of the last successful reload
    last_reload: Mutex<Option<Instant>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Domain {
    pub fn new(node_id: impl Into<NodeId>, store: Arc<dyn Storage>, config: DdlConfig) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            config,
            info: RwLock::new(Arc::new(InfoSchema::default())),
            last_reload: Mutex::new(None),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Version of the snapshot currently held, regardless of staleness
    pub fn loaded_version(&self) -> SchemaVersion {
        self.info.read().version()
    }

    /// Current snapshot. Fails if the node has not reloaded for a full lease.
    pub fn info_schema(&self) -> Result<Arc<InfoSchema>> {
        let fresh = self
            .last_reload
            .lock()
            .is_some_and(|at| at.elapsed() < self.config.lease);
        if !fresh {
            return Err(DdlError::SchemaExpired(self.node_id.clone()));
        }
        Ok(self.info.read().clone())
    }

    /// Load the latest schema version, install it, then publish the
    /// heartbeat. The heartbeat never reports a version this node is not
    /// serving yet.
    pub fn reload(&self) -> Result<SchemaVersion> {
        let current = self.info.read().clone();
        let started = Instant::now();
        let loaded = run_in_new_txn(self.store.as_ref(), self.config.retry_policy(), |txn| -> Result<Option<InfoSchema>> {
            let mut m = Meta::new(txn);
            let latest = m.schema_version()?;
            if latest == current.version() {
                return Ok(None);
            }
            let incremental = if latest > current.version() && latest - current.version() <= MAX_DIFF_REPLAY {
                apply_diffs(&mut m, &current, latest)?
            } else {
                None
            };
            match incremental {
                Some(info) => Ok(Some(info)),
                None => Ok(Some(load_full(&mut m, latest)?)),
            }
        })?;

        if let Some(info) = loaded {
            let version = info.version();
            debug!(
                "[{}] schema reloaded from version {} to {} in {:?}",
                self.node_id,
                current.version(),
                version,
                started.elapsed()
            );
            let mut guard = self.info.write();
            // a concurrent reload may already have installed a newer one
            if guard.version() < version {
                *guard = Arc::new(info);
            }
        }

        run_in_new_txn(self.store.as_ref(), self.config.retry_policy(), |txn| -> Result<()> {
            Meta::new(txn).set_node_status(&NodeStatus {
                node_id: self.node_id.clone(),
                loaded_version: self.loaded_version(),
                lease_expiry_ms: expiry_after(self.config.lease),
            })
        })?;
        *self.last_reload.lock() = Some(started);
        Ok(self.loaded_version())
    }

    /// Make sure the local snapshot is at least `version`
    pub fn ensure_version(&self, version: SchemaVersion) -> Result<()> {
        if self.loaded_version() < version {
            self.reload()?;
        }
        Ok(())
    }

    /// Start the periodic reload loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.reload()?;
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(self.config.schema_reload_interval);
        let domain = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("schema-reload-{}", self.node_id))
            .spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(e) = domain.reload() {
                                warn!("[{}] schema reload failed: {}", domain.node_id, e);
                            }
                        }
                    }
                }
            })
            .map_err(|e| DdlError::Internal(format!("failed to spawn reload thread: {}", e)))?;
        *self.stop_tx.lock() = Some(stop_tx);
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop reloading and withdraw this node's heartbeat
    pub fn close(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        *self.last_reload.lock() = None;
        let removed = run_in_new_txn(self.store.as_ref(), self.config.retry_policy(), |txn| {
            Meta::new(txn).remove_node_status(&self.node_id)
        });
        if let Err(e) = removed {
            warn!("[{}] failed to remove node status: {}", self.node_id, e);
        }
    }
}

fn load_full(m: &mut Meta, version: SchemaVersion) -> Result<InfoSchema> {
    let schemas = m.list_databases()?;
    let mut tables = Vec::new();
    for db in &schemas {
        tables.extend(m.list_tables(db.id)?);
    }
    Ok(InfoSchema::new(version, schemas, tables))
}

/// Replay the diffs after `current` up to `latest`. `None` if one is missing.
fn apply_diffs(m: &mut Meta, current: &InfoSchema, latest: SchemaVersion) -> Result<Option<InfoSchema>> {
    let mut next = current.clone();
    for version in (current.version() + 1)..=latest {
        let Some(diff) = m.schema_diff(version)? else {
            return Ok(None);
        };
        match diff.job_type {
            JobType::CreateSchema | JobType::DropSchema => {
                let db = m.database(diff.schema_id)?;
                next.apply_schema(diff.schema_id, db);
            }
            _ => {
                let table = m.table(diff.schema_id, diff.table_id)?;
                next.apply_table(diff.table_id, table);
            }
        }
    }
    next.set_version(latest);
    Ok(Some(next))
}
