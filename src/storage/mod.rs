// Storage Module
//
// Transactional key-value store interface and the key layout used on top of it.

pub mod codec;
pub mod kv;

pub use kv::{KvError, MemStore, RetryPolicy, Storage, Transaction, run_in_new_txn};
