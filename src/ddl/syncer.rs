// Schema Version Publisher
//
// After the owner commits a new schema version it waits here until every
// live node reports that version through its heartbeat, or until a full
// lease has passed. A node that neither acknowledges nor lets its heartbeat
// expire within that time has stopped reloading, and its own domain refuses
// to serve the old snapshot once its lease runs out.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, warn};

use crate::common::clock::now_millis;
use crate::common::{NodeId, SchemaVersion};
use crate::config::DdlConfig;
use crate::ddl::error::Result;
use crate::meta::Meta;
use crate::model::NodeStatus;
use crate::storage::Storage;

pub struct SchemaSyncer {
    store: Arc<dyn Storage>,
    config: DdlConfig,
}

impl SchemaSyncer {
    pub fn new(store: Arc<dyn Storage>, config: DdlConfig) -> Self {
        Self { store, config }
    }

    /// Heartbeats of every node that ever reported
    pub fn node_statuses(&self) -> Result<Vec<NodeStatus>> {
        let mut txn = self.store.begin()?;
        let statuses = Meta::new(txn.as_mut()).node_statuses();
        txn.rollback();
        statuses
    }

    /// Live nodes that have not loaded `version` yet
    pub fn lagging_nodes(&self, version: SchemaVersion) -> Result<Vec<NodeId>> {
        let now = now_millis();
        Ok(self
            .node_statuses()?
            .into_iter()
            .filter(|s| s.is_live(now) && s.loaded_version < version)
            .map(|s| s.node_id)
            .collect())
    }

    /// Block until every live node has loaded `version` or one lease has
    /// elapsed. Returns the nodes that were still behind at the deadline.
    pub fn wait_version_synced(&self, version: SchemaVersion) -> Result<Vec<NodeId>> {
        let started = Instant::now();
        loop {
            let lagging = self.lagging_nodes(version)?;
            if lagging.is_empty() {
                debug!("schema version {} synced in {:?}", version, started.elapsed());
                return Ok(lagging);
            }
            if started.elapsed() >= self.config.lease {
                warn!(
                    "nodes {:?} did not acknowledge schema version {} within {:?}, treating them as stale",
                    lagging, version, self.config.lease
                );
                return Ok(lagging);
            }
            thread::sleep(self.config.sync_poll_interval);
        }
    }
}
