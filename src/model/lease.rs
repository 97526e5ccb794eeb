// Coordination records: the owner lease, per-node schema heartbeats and
// the append-only schema diff log.

use serde::{Deserialize, Serialize};

use super::job::JobType;
use crate::common::{JobId, NodeId, SchemaId, SchemaVersion, TableId};

/// The DDL owner lease. At most one unexpired lease exists at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner_id: NodeId,
    /// Wall-clock millis after which anyone may take the lease
    pub expiry_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiry_ms
    }
}

/// Heartbeat a node writes after every schema reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub loaded_version: SchemaVersion,
    /// The node stops serving its loaded schema after this instant unless
    /// it reloads again
    pub lease_expiry_ms: u64,
}

impl NodeStatus {
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.lease_expiry_ms
    }
}

/// What changed at one schema version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: SchemaVersion,
    pub job_id: JobId,
    pub job_type: JobType,
    pub schema_id: SchemaId,
    pub table_id: TableId,
}
