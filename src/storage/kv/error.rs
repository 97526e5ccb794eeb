use std::io;
use thiserror::Error;

/// Error type for key-value store operations
#[derive(Error, Debug)]
pub enum KvError {
    #[error("Write conflict on key {0}")]
    WriteConflict(String),

    #[error("Store timeout: {0}")]
    Timeout(String),

    #[error("Transaction already finished")]
    TxnFinished,

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Snapshot codec error: {0}")]
    CodecError(String),
}

impl KvError {
    /// Conflicts and timeouts leave the store unchanged and may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::WriteConflict(_) | KvError::Timeout(_))
    }
}

/// Result type for key-value store operations
pub type Result<T> = std::result::Result<T, KvError>;
