// In-memory multi-version store
//
// Every committed write is stamped with a commit timestamp. Transactions
// read the newest version at or below their start timestamp and are
// validated at commit time: if any key they read or wrote has a version
// newer than their start timestamp, the commit fails with a write conflict.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use super::error::{KvError, Result};
use super::{Storage, Transaction};

/// A committed version of a key. `None` marks a deletion.
#[derive(Debug, Clone)]
struct Version {
    commit_ts: u64,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Versions per key, oldest first
    data: RwLock<BTreeMap<Vec<u8>, Vec<Version>>>,
    /// Last allocated timestamp
    ts: AtomicU64,
    /// Start timestamps of open transactions, with a reference count
    active: Mutex<BTreeMap<u64, usize>>,
    /// Number of upcoming commits that should fail with a timeout
    fail_commits: AtomicUsize,
}

impl StoreInner {
    fn register(&self) -> u64 {
        let mut active = self.active.lock();
        let start_ts = self.ts.load(Ordering::SeqCst);
        *active.entry(start_ts).or_insert(0) += 1;
        start_ts
    }

    fn unregister(&self, start_ts: u64) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&start_ts) {
            *count -= 1;
            if *count == 0 {
                active.remove(&start_ts);
            }
        }
    }

    fn oldest_active(&self) -> u64 {
        let active = self.active.lock();
        active.keys().next().copied().unwrap_or(u64::MAX)
    }
}

/// Drop versions that no open or future transaction can observe: everything
/// older than the newest version visible at `oldest_active`.
fn prune(versions: &mut Vec<Version>, oldest_active: u64) {
    let visible = versions.iter().rposition(|v| v.commit_ts <= oldest_active);
    if let Some(idx) = visible {
        if idx > 0 {
            versions.drain(..idx);
        }
    }
}

fn visible_at(versions: &[Version], ts: u64) -> Option<&Version> {
    versions.iter().rev().find(|v| v.commit_ts <= ts)
}

/// In-memory transactional store
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<StoreInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a retryable timeout
    pub fn inject_commit_failures(&self, n: usize) {
        self.inner.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Number of live (non-deleted) keys
    pub fn len(&self) -> usize {
        let data = self.inner.data.read();
        data.values()
            .filter(|versions| versions.last().is_some_and(|v| v.value.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the latest committed value of every key to `path`
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot: BTreeMap<Vec<u8>, Vec<u8>> = {
            let data = self.inner.data.read();
            data.iter()
                .filter_map(|(k, versions)| {
                    versions.last().and_then(|v| v.value.clone()).map(|v| (k.clone(), v))
                })
                .collect()
        };
        let tmp_path = path.as_ref().with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            bincode::serialize_into(&mut writer, &snapshot)
                .map_err(|e| KvError::CodecError(e.to_string()))?;
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Open a store from a file written by `save_to`
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: BTreeMap<Vec<u8>, Vec<u8>> =
            bincode::deserialize_from(reader).map_err(|e| KvError::CodecError(e.to_string()))?;
        let store = MemStore::new();
        {
            let mut data = store.inner.data.write();
            for (k, v) in snapshot {
                data.insert(k, vec![Version { commit_ts: 1, value: Some(v) }]);
            }
        }
        store.inner.ts.store(1, Ordering::SeqCst);
        Ok(store)
    }
}

impl Storage for MemStore {
    fn begin(&self) -> Result<Box<dyn Transaction>> {
        let start_ts = self.inner.register();
        Ok(Box::new(MemTxn {
            store: self.inner.clone(),
            start_ts,
            reads: HashSet::new(),
            writes: BTreeMap::new(),
            finished: false,
        }))
    }
}

/// Transaction over a `MemStore`
struct MemTxn {
    store: Arc<StoreInner>,
    start_ts: u64,
    reads: HashSet<Vec<u8>>,
    /// Buffered writes; `None` is a delete
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    finished: bool,
}

impl MemTxn {
    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(KvError::TxnFinished);
        }
        Ok(())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.store.unregister(self.start_ts);
        }
    }
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Transaction for MemTxn {
    fn start_ts(&self) -> u64 {
        self.start_ts
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        self.reads.insert(key.to_vec());
        let data = self.store.data.read();
        Ok(data
            .get(key)
            .and_then(|versions| visible_at(versions, self.start_ts))
            .and_then(|v| v.value.clone()))
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan(&mut self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        let mut out = Vec::new();
        if start >= end || limit == 0 {
            return Ok(out);
        }
        let range = (Bound::Included(start), Bound::Excluded(end));
        let data = self.store.data.read();
        let mut committed = data
            .range::<[u8], _>(range)
            .filter_map(|(k, versions)| visible_at(versions, self.start_ts).map(|v| (k, v.value.as_ref())))
            .peekable();
        let mut buffered = self.writes.range::<[u8], _>(range).peekable();
        let mut seen = Vec::new();

        while out.len() < limit {
            let take_buffered = match (committed.peek(), buffered.peek()) {
                (None, None) => break,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some((ck, _)), Some((bk, _))) => bk.as_slice() <= ck.as_slice(),
            };
            if take_buffered {
                if let Some((bk, bv)) = buffered.next() {
                    if committed.peek().is_some_and(|(ck, _)| ck.as_slice() == bk.as_slice()) {
                        committed.next();
                    }
                    if let Some(v) = bv {
                        out.push((bk.clone(), v.clone()));
                    }
                }
            } else if let Some((ck, cv)) = committed.next() {
                seen.push(ck.clone());
                if let Some(v) = cv {
                    out.push((ck.clone(), v.clone()));
                }
            }
        }
        drop(committed);
        drop(data);
        self.reads.extend(seen);
        Ok(out)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.check_open()?;
        if self.writes.is_empty() {
            self.finish();
            return Ok(());
        }
        let injected = self
            .store
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.finish();
            return Err(KvError::Timeout("injected commit failure".to_string()));
        }

        let store = self.store.clone();
        let mut data = store.data.write();
        let conflict = self
            .reads
            .iter()
            .chain(self.writes.keys())
            .find(|key| {
                data.get(*key)
                    .and_then(|versions| versions.last())
                    .is_some_and(|v| v.commit_ts > self.start_ts)
            })
            .map(hex::encode);
        if let Some(key) = conflict {
            drop(data);
            self.finish();
            return Err(KvError::WriteConflict(key));
        }

        let commit_ts = store.ts.fetch_add(1, Ordering::SeqCst) + 1;
        // A transaction registering while we hold the lock starts at
        // commit_ts - 1 at the earliest.
        let floor = store.oldest_active().min(commit_ts - 1);
        let writes = std::mem::take(&mut self.writes);
        for (key, value) in writes {
            let versions = data.entry(key).or_default();
            versions.push(Version { commit_ts, value });
            prune(versions, floor);
        }
        drop(data);
        self.finish();
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        self.finish();
    }
}
