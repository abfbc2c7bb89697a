//! RocksDB-backed state store.
//!
//! This module is feature-gated. Enable with `--features rocksdb`.
//! Rows are stored as `version u64 BE || payload`; snapshots use
//! `multi_get` and commits apply one `WriteBatch` under a store-level
//! mutex, which is what upholds the version-precondition check-and-write
//! against concurrent committers in this process. When the feature is
//! disabled, all public constructors and methods return explicit backend
//! errors.

use std::path::Path;
#[cfg(feature = "rocksdb")]
use std::sync::Mutex;

use super::errors::StoreError;
use super::store::{CommitRequest, StateStore, VersionedValue};

#[cfg(feature = "rocksdb")]
use rocksdb::{Options, WriteBatch, DB};

/// Store-internal key holding the last committed sequence.
#[cfg(feature = "rocksdb")]
const COMMIT_SEQ_KEY: &[u8; 6] = b"cs/seq";

/// RocksDB-backed versioned key/value store.
#[derive(Debug)]
pub struct RocksDbStateStore {
    #[cfg(feature = "rocksdb")]
    db: DB,
    #[cfg(feature = "rocksdb")]
    commit_lock: Mutex<()>,
}

impl RocksDbStateStore {
    /// Opens or creates a RocksDB database at the given path.
    ///
    /// # Errors
    /// Returns a backend error when RocksDB cannot be opened or the
    /// feature is disabled.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        #[cfg(feature = "rocksdb")]
        {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            let db =
                DB::open(&opts, path).map_err(|err| StoreError::backend(err.to_string()))?;
            Ok(Self {
                db,
                commit_lock: Mutex::new(()),
            })
        }

        #[cfg(not(feature = "rocksdb"))]
        {
            let _ = path;
            Err(StoreError::backend("rocksdb support not enabled"))
        }
    }

    #[cfg(feature = "rocksdb")]
    fn decode_row(bytes: &[u8]) -> Result<VersionedValue, StoreError> {
        if bytes.len() < 8 {
            return Err(StoreError::corrupt("row shorter than version prefix"));
        }
        let version = u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"));
        Ok(VersionedValue {
            version,
            value: bytes[8..].to_vec(),
        })
    }

    #[cfg(feature = "rocksdb")]
    fn encode_row(version: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[cfg(feature = "rocksdb")]
    fn current_version(&self, key: &[u8]) -> Result<u64, StoreError> {
        match self
            .db
            .get(key)
            .map_err(|err| StoreError::backend(err.to_string()))?
        {
            Some(bytes) => Ok(Self::decode_row(&bytes)?.version),
            None => Ok(0),
        }
    }

    #[cfg(feature = "rocksdb")]
    fn last_commit_seq(&self) -> Result<u64, StoreError> {
        match self
            .db
            .get(COMMIT_SEQ_KEY)
            .map_err(|err| StoreError::backend(err.to_string()))?
        {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::corrupt("commit sequence must be 8 bytes"))?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }
}

impl StateStore for RocksDbStateStore {
    fn snapshot(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<VersionedValue>>, StoreError> {
        #[cfg(feature = "rocksdb")]
        {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let results = self.db.multi_get(keys.iter());
            let mut out = Vec::with_capacity(results.len());
            for result in results {
                match result {
                    Ok(Some(bytes)) => out.push(Some(Self::decode_row(&bytes)?)),
                    Ok(None) => out.push(None),
                    Err(err) => return Err(StoreError::backend(err.to_string())),
                }
            }
            Ok(out)
        }

        #[cfg(not(feature = "rocksdb"))]
        {
            let _ = keys;
            Err(StoreError::backend("rocksdb support not enabled"))
        }
    }

    fn commit(&self, request: CommitRequest) -> Result<u64, StoreError> {
        #[cfg(feature = "rocksdb")]
        {
            let _guard = self.commit_lock.lock().expect("commit lock poisoned");

            for pre in &request.preconditions {
                if self.current_version(&pre.key)? != pre.expected_version {
                    return Err(StoreError::Conflict);
                }
            }

            let version = self.last_commit_seq()? + 1;
            let mut batch = WriteBatch::default();
            for op in &request.writes {
                batch.put(&op.key, Self::encode_row(version, &op.value));
            }
            batch.put(COMMIT_SEQ_KEY, version.to_be_bytes());
            self.db
                .write(batch)
                .map_err(|err| StoreError::backend(err.to_string()))?;
            Ok(version)
        }

        #[cfg(not(feature = "rocksdb"))]
        {
            let _ = request;
            Err(StoreError::backend("rocksdb support not enabled"))
        }
    }
}
