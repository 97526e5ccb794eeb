// Persisted backfill progress

use serde::{Deserialize, Serialize};

/// One key sub-range `[start, end)` a backfill worker owns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

/// Progress of one sub-range, written in the same transaction as the batch
/// it describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgCheckpoint {
    /// Last key processed, if any
    pub last_key: Option<Vec<u8>>,
    pub done: bool,
    pub processed: u64,
}

impl ReorgCheckpoint {
    pub fn start() -> Self {
        Self { last_key: None, done: false, processed: 0 }
    }
}
