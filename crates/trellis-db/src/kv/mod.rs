//! Ordered key/value contract and the in-memory backend.
//!
//! The store runtime only assumes a range-scannable sorted map with
//! transactions: snapshot reads, buffered writes, first-committer-wins
//! conflict detection. Durable backends plug in behind the same traits.

pub mod tuple;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::error::{DbError, DbResult};

/// A transactional, range-scannable sorted map.
pub trait OrderedKv: Send + Sync {
    fn begin(&self) -> Box<dyn OrderedKvTx>;
}

/// One open transaction. Reads see a snapshot plus the transaction's own
/// writes; `commit` fails with `TransactionConflict` when another commit
/// touched a written key first.
pub trait OrderedKvTx: Send {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);
    fn delete(&mut self, key: Vec<u8>);
    fn commit(self: Box<Self>) -> DbResult<()>;
}

#[derive(Default)]
struct Shared {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Commit sequence that last wrote each key.
    versions: BTreeMap<Vec<u8>, u64>,
    commit_seq: u64,
}

/// In-memory ordered KV. The reference backend; also what tests run on.
#[derive(Clone, Default)]
pub struct MemoryKv {
    shared: Arc<RwLock<Shared>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys; handy in tests.
    pub fn len(&self) -> usize {
        self.shared.read().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OrderedKv for MemoryKv {
    fn begin(&self) -> Box<dyn OrderedKvTx> {
        let guard = self.shared.read().unwrap_or_else(|e| e.into_inner());
        Box::new(MemoryKvTx {
            shared: Arc::clone(&self.shared),
            snapshot: guard.map.clone(),
            read_seq: guard.commit_seq,
            writes: BTreeMap::new(),
        })
    }
}

struct MemoryKvTx {
    shared: Arc<RwLock<Shared>>,
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
    read_seq: u64,
    /// `None` marks a delete.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl OrderedKvTx for MemoryKvTx {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(staged) = self.writes.get(key) {
            return staged.clone();
        }
        self.snapshot.get(key).cloned()
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let range = (Bound::Included(prefix.to_vec()), Bound::Unbounded);
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = self
            .snapshot
            .range(range)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), Some(value.clone())))
            .collect();
        for (key, staged) in &self.writes {
            if key.starts_with(prefix) {
                merged.insert(key.clone(), staged.clone());
            }
        }
        merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect()
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    fn commit(self: Box<Self>) -> DbResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut guard = self.shared.write().unwrap_or_else(|e| e.into_inner());
        for key in self.writes.keys() {
            if guard.versions.get(key).copied().unwrap_or(0) > self.read_seq {
                return Err(DbError::TransactionConflict);
            }
        }
        guard.commit_seq += 1;
        let seq = guard.commit_seq;
        for (key, staged) in self.writes {
            match staged {
                Some(value) => {
                    guard.map.insert(key.clone(), value);
                }
                None => {
                    guard.map.remove(&key);
                }
            }
            guard.versions.insert(key, seq);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_see_own_writes_but_not_later_commits() {
        let kv = MemoryKv::new();

        let mut tx = kv.begin();
        tx.put(b"a".to_vec(), b"1".to_vec());
        assert_eq!(tx.get(b"a"), Some(b"1".to_vec()));
        tx.commit().expect("commits");

        let reader = kv.begin();
        let mut writer = kv.begin();
        writer.put(b"a".to_vec(), b"2".to_vec());
        writer.commit().expect("commits");
        // reader still sees the snapshot
        assert_eq!(reader.get(b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn conflicting_commit_is_rejected() {
        let kv = MemoryKv::new();
        let mut first = kv.begin();
        let mut second = kv.begin();
        first.put(b"k".to_vec(), b"1".to_vec());
        second.put(b"k".to_vec(), b"2".to_vec());
        first.commit().expect("first wins");
        let err = second.commit().expect_err("second conflicts");
        assert_eq!(err.kind(), "TransactionConflict");
    }

    #[test]
    fn read_only_transactions_never_conflict() {
        let kv = MemoryKv::new();
        let reader = kv.begin();
        let mut writer = kv.begin();
        writer.put(b"k".to_vec(), b"1".to_vec());
        writer.commit().expect("commits");
        reader.commit().expect("empty commit is fine");
    }

    #[test]
    fn prefix_scan_merges_staged_writes() {
        let kv = MemoryKv::new();
        let mut tx = kv.begin();
        tx.put(b"p/a".to_vec(), b"1".to_vec());
        tx.put(b"p/b".to_vec(), b"2".to_vec());
        tx.put(b"q/a".to_vec(), b"3".to_vec());
        tx.commit().expect("commits");

        let mut tx = kv.begin();
        tx.delete(b"p/a".to_vec());
        tx.put(b"p/c".to_vec(), b"4".to_vec());
        let seen: Vec<Vec<u8>> = tx
            .scan_prefix(b"p/")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(seen, vec![b"p/b".to_vec(), b"p/c".to_vec()]);
    }
}
