// BayunDB DDL Configuration

use std::time::Duration;

use crate::ddl::error::{DdlError, Result};
use crate::storage::RetryPolicy;

/// Configuration for one DDL node
#[derive(Debug, Clone)]
pub struct DdlConfig {
    /// Owner lease and schema lease period
    pub lease: Duration,

    /// How often the owner renews its lease; must be shorter than `lease`
    pub owner_renew_interval: Duration,

    /// How often a node reloads the schema; must be shorter than `lease`
    pub schema_reload_interval: Duration,

    /// Rows (or keys) per backfill transaction
    pub backfill_batch_size: usize,

    /// Parallel backfill workers over disjoint handle ranges
    pub backfill_workers: usize,

    /// Initial backoff after a retryable error
    pub retry_backoff: Duration,

    /// Upper bound for the exponential backoff
    pub max_retry_backoff: Duration,

    /// Optimistic transaction retries before giving up
    pub max_txn_retries: usize,

    /// Poll interval while waiting for nodes to load a schema version
    pub sync_poll_interval: Duration,

    /// Poll interval while waiting for a job to finish
    pub wait_poll_interval: Duration,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self::with_lease(Duration::from_secs(1))
    }
}

impl DdlConfig {
    /// Defaults scaled to the given lease
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease,
            owner_renew_interval: lease / 3,
            schema_reload_interval: lease / 2,
            backfill_batch_size: 256,
            backfill_workers: 1,
            retry_backoff: Duration::from_millis(10),
            max_retry_backoff: Duration::from_secs(1),
            max_txn_retries: 16,
            sync_poll_interval: Duration::from_millis(5),
            wait_poll_interval: Duration::from_millis(10),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease.is_zero() {
            return Err(DdlError::Config("lease must be positive".to_string()));
        }
        if self.owner_renew_interval.is_zero() || self.owner_renew_interval >= self.lease {
            return Err(DdlError::Config(format!(
                "owner renew interval {:?} must be shorter than the lease {:?}",
                self.owner_renew_interval, self.lease
            )));
        }
        if self.schema_reload_interval.is_zero() || self.schema_reload_interval >= self.lease {
            return Err(DdlError::Config(format!(
                "schema reload interval {:?} must be shorter than the lease {:?}",
                self.schema_reload_interval, self.lease
            )));
        }
        if self.backfill_batch_size == 0 {
            return Err(DdlError::Config("backfill batch size must be positive".to_string()));
        }
        if self.backfill_workers == 0 {
            return Err(DdlError::Config("at least one backfill worker is required".to_string()));
        }
        Ok(())
    }

    /// Retry policy for the short transactions issued by the engine
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_txn_retries,
            backoff: self.retry_backoff,
            max_backoff: self.max_retry_backoff,
        }
    }
}
