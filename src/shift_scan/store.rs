//! Key state store contract and the in-memory backend.
//!
//! The store is a versioned key/value space with optimistic transactions:
//! a caller snapshots the keys it will touch, computes writes, and
//! commits with the snapshot versions as preconditions. A precondition
//! mismatch aborts the commit with [`StoreError::Conflict`] and the
//! caller re-runs against a fresh snapshot. Per key this serializes all
//! mutations; across keys a commit is atomic.
//!
//! # Contract
//! - `snapshot` returns one entry per input key, in input order; `None`
//!   means the key has no row (its `is_new` signal).
//! - `commit` applies all writes or none. Every write's key must carry a
//!   precondition; version 0 means "must still be absent".
//! - Commit sequences are strictly increasing and double as the export
//!   row version.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::errors::StoreError;

/// A stored value with its row version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    /// Commit sequence that last wrote this row; never zero.
    pub version: u64,
    /// Row payload.
    pub value: Vec<u8>,
}

/// One write in a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteOp {
    /// Store key.
    pub key: Vec<u8>,
    /// New row payload.
    pub value: Vec<u8>,
}

/// Version precondition for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Precondition {
    /// Store key.
    pub key: Vec<u8>,
    /// Expected current version; 0 means the key must be absent.
    pub expected_version: u64,
}

/// An atomic commit: preconditions plus writes.
#[derive(Clone, Debug, Default)]
pub struct CommitRequest {
    /// Versions observed at snapshot time for every key involved.
    pub preconditions: Vec<Precondition>,
    /// Rows to write if all preconditions hold.
    pub writes: Vec<WriteOp>,
}

/// Versioned key/value store with optimistic transactions.
pub trait StateStore: Send + Sync {
    /// Reads current versions and values for `keys`, in input order.
    fn snapshot(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<VersionedValue>>, StoreError>;

    /// Atomically applies `request` and returns the commit sequence.
    ///
    /// Fails with [`StoreError::Conflict`] when any precondition no
    /// longer holds; nothing is written in that case.
    fn commit(&self, request: CommitRequest) -> Result<u64, StoreError>;
}

/// Outcome of a read-modify-write transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RmwOutcome {
    /// True when the closure produced writes and they were committed.
    pub committed: bool,
    /// Commit sequence of the applied writes; 0 when nothing committed.
    pub commit_version: u64,
    /// Snapshot/commit attempts consumed.
    pub attempts: usize,
}

/// Runs `mutate` transactionally over `keys`, retrying on conflict.
///
/// `mutate` receives the snapshot (one entry per key, input order) and
/// returns the writes to apply, or `None` to commit nothing (the
/// duplicate-batch case). Preconditions are taken from the snapshot over
/// all input keys, so any concurrent change to any of them forces a
/// re-run.
pub fn read_modify_write<F>(
    store: &dyn StateStore,
    keys: &[Vec<u8>],
    max_attempts: usize,
    mut mutate: F,
) -> Result<RmwOutcome, StoreError>
where
    F: FnMut(&[Option<VersionedValue>]) -> Result<Option<Vec<WriteOp>>, StoreError>,
{
    assert!(max_attempts > 0, "transaction attempt budget must be > 0");

    for attempt in 1..=max_attempts {
        let snapshot = store.snapshot(keys)?;
        let writes = match mutate(&snapshot)? {
            Some(writes) => writes,
            None => {
                return Ok(RmwOutcome {
                    committed: false,
                    commit_version: 0,
                    attempts: attempt,
                })
            }
        };

        let preconditions = keys
            .iter()
            .zip(&snapshot)
            .map(|(key, entry)| Precondition {
                key: key.clone(),
                expected_version: entry.as_ref().map_or(0, |v| v.version),
            })
            .collect();

        match store.commit(CommitRequest {
            preconditions,
            writes,
        }) {
            Ok(commit_version) => {
                return Ok(RmwOutcome {
                    committed: true,
                    commit_version,
                    attempts: attempt,
                })
            }
            Err(StoreError::Conflict) => continue,
            Err(err) => return Err(err),
        }
    }

    Err(StoreError::Conflict)
}

/// In-memory store for tests and small runs.
///
/// A `BTreeMap` under a mutex: commits serialize on the lock, which
/// trivially satisfies the atomicity and isolation contract.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    rows: BTreeMap<Vec<u8>, VersionedValue>,
    commit_seq: u64,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").rows.len()
    }

    /// Number of rows whose key starts with `prefix`.
    #[must_use]
    pub fn rows_with_prefix(&self, prefix: &[u8]) -> usize {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .rows
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }

    /// Reads one row's payload, for test assertions.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.rows.get(key).map(|v| v.value.clone())
    }
}

impl StateStore for InMemoryStateStore {
    fn snapshot(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<VersionedValue>>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(keys.iter().map(|k| inner.rows.get(k).cloned()).collect())
    }

    fn commit(&self, request: CommitRequest) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");

        for pre in &request.preconditions {
            let current = inner.rows.get(&pre.key).map_or(0, |v| v.version);
            if current != pre.expected_version {
                return Err(StoreError::Conflict);
            }
        }

        inner.commit_seq += 1;
        let version = inner.commit_seq;
        for op in request.writes {
            inner.rows.insert(
                op.key,
                VersionedValue {
                    version,
                    value: op.value,
                },
            );
        }
        Ok(version)
    }
}
