// Key-Value Store Interface
//
// The engine only needs transactional point reads/writes, bounded range
// scans and optimistic conflict detection from the underlying store. Global
// ids are allocated on top of it by `meta`.

pub mod error;
pub mod memory;

use std::time::Duration;

pub use error::{KvError, Result};
pub use memory::MemStore;

/// A single optimistic transaction
pub trait Transaction: Send {
    /// Timestamp of the snapshot this transaction reads from
    fn start_ts(&self) -> u64;

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Keys in `[start, end)` in ascending order, at most `limit` of them
    fn scan(&mut self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Commit buffered writes. Fails with a retryable error if any key read
    /// or written was committed by someone else after `start_ts`.
    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>);
}

/// A transactional store shared by every node
pub trait Storage: Send + Sync {
    fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Errors that may be retried by `run_in_new_txn`
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for KvError {
    fn is_retryable(&self) -> bool {
        KvError::is_retryable(self)
    }
}

/// Retry policy for `run_in_new_txn`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 16,
            backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(200),
        }
    }
}

/// Run `f` in a fresh transaction and commit it, retrying the whole closure
/// on retryable errors with exponential backoff.
pub fn run_in_new_txn<T, E, F>(store: &dyn Storage, policy: RetryPolicy, mut f: F) -> std::result::Result<T, E>
where
    E: From<KvError> + Retryable,
    F: FnMut(&mut dyn Transaction) -> std::result::Result<T, E>,
{
    let mut backoff = policy.backoff;
    let mut attempt = 0;
    loop {
        let mut txn = store.begin()?;
        let result = match f(txn.as_mut()) {
            Ok(value) => txn.commit().map(|_| value).map_err(E::from),
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        };
        match result {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            other => return other,
        }
    }
}
