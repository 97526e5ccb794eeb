// DDL Owner Election
//
// The owner is whoever holds the unexpired lease record in the store. The
// holder renews it on a background ticker well inside the lease period; if
// renewal stops the lease simply runs out and another node takes it on its
// next campaign. Every owner step re-reads the lease inside its own
// transaction, so a takeover that races a step makes that step's commit fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use log::{info, warn};
use parking_lot::Mutex;

use crate::common::NodeId;
use crate::common::clock::{expiry_after, now_millis};
use crate::config::DdlConfig;
use crate::ddl::error::{DdlError, Result};
use crate::meta::Meta;
use crate::model::Lease;
use crate::storage::{Storage, run_in_new_txn};

/// Checked by long-running owner work between short transactions
pub trait LeaseGuard: Send + Sync {
    fn ensure_valid(&self) -> Result<()>;
}

pub struct OwnerManager {
    node_id: NodeId,
    store: Arc<dyn Storage>,
    config: DdlConfig,
    /// Expiry of the lease this node holds, 0 when it holds none
    expiry_ms: AtomicU64,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OwnerManager {
    pub fn new(node_id: impl Into<NodeId>, store: Arc<dyn Storage>, config: DdlConfig) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            config,
            expiry_ms: AtomicU64::new(0),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether this node holds an unexpired lease, by its own clock
    pub fn is_owner(&self) -> bool {
        now_millis() < self.expiry_ms.load(Ordering::SeqCst)
    }

    /// Acquire the lease if it is free or expired, renew it if it is ours.
    /// Returns whether this node holds it afterwards.
    pub fn campaign(&self) -> Result<bool> {
        let was_owner = self.is_owner();
        let expiry = expiry_after(self.config.lease);
        let acquired = run_in_new_txn(self.store.as_ref(), self.config.retry_policy(), |txn| -> Result<bool> {
            let mut m = Meta::new(txn);
            match m.owner_lease()? {
                Some(lease) if lease.owner_id != self.node_id && !lease.is_expired(now_millis()) => Ok(false),
                _ => {
                    m.set_owner_lease(&Lease { owner_id: self.node_id.clone(), expiry_ms: expiry })?;
                    Ok(true)
                }
            }
        })?;

        if acquired {
            self.expiry_ms.store(expiry, Ordering::SeqCst);
            if !was_owner {
                info!("[{}] became DDL owner", self.node_id);
            }
        } else {
            self.expiry_ms.store(0, Ordering::SeqCst);
            if was_owner {
                info!("[{}] lost DDL ownership", self.node_id);
            }
        }
        Ok(acquired)
    }

    /// Verify inside an owner transaction that the stored lease is still ours
    pub fn check_lease(&self, meta: &mut Meta) -> Result<()> {
        match meta.owner_lease()? {
            Some(lease) if lease.owner_id == self.node_id && !lease.is_expired(now_millis()) => Ok(()),
            _ => {
                self.expiry_ms.store(0, Ordering::SeqCst);
                Err(DdlError::LeaseLost(self.node_id.clone()))
            }
        }
    }

    /// Campaign once, then keep campaigning on the renew interval
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if let Err(e) = self.campaign() {
            warn!("[{}] owner campaign failed: {}", self.node_id, e);
        }
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(self.config.owner_renew_interval);
        let owner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("ddl-owner-{}", self.node_id))
            .spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(e) = owner.campaign() {
                                warn!("[{}] owner campaign failed: {}", owner.node_id, e);
                            }
                        }
                    }
                }
            })
            .map_err(|e| DdlError::Internal(format!("failed to spawn owner thread: {}", e)))?;
        *self.stop_tx.lock() = Some(stop_tx);
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop renewing and release the lease if this node holds it
    pub fn resign(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        if self.expiry_ms.swap(0, Ordering::SeqCst) == 0 {
            return;
        }
        let released = run_in_new_txn(self.store.as_ref(), self.config.retry_policy(), |txn| -> Result<()> {
            let mut m = Meta::new(txn);
            match m.owner_lease()? {
                Some(lease) if lease.owner_id == self.node_id => m.clear_owner_lease(),
                _ => Ok(()),
            }
        });
        match released {
            Ok(()) => info!("[{}] resigned DDL ownership", self.node_id),
            Err(e) => warn!("[{}] failed to release owner lease: {}", self.node_id, e),
        }
    }
}

impl LeaseGuard for OwnerManager {
    fn ensure_valid(&self) -> Result<()> {
        if self.is_owner() {
            Ok(())
        } else {
            Err(DdlError::LeaseLost(self.node_id.clone()))
        }
    }
}
