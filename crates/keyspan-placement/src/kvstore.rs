//! Durable metadata store seam.
//!
//! The placement engine persists rules, rule groups and label rules through
//! this trait. The in-memory store backs tests and the command-line tool; a
//! deployment plugs in its replicated metadata store instead.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::types::PlacementError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for placement metadata persistence.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, PlacementError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), PlacementError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), PlacementError>;

    /// Scan keys in `[start, end)` in sorted order, returning at most `limit` pairs.
    /// An empty `end` scans to the end of the key space.
    fn scan_range(&self, start: &[u8], end: &[u8], limit: usize)
        -> Result<Vec<KvPair>, PlacementError>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), PlacementError>;
}

/// A single operation in a write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist data across restarts.
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PlacementError> {
        let data = self
            .data
            .read()
            .map_err(|e| PlacementError::Storage(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), PlacementError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| PlacementError::Storage(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), PlacementError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| PlacementError::Storage(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PlacementError> {
        let data = self
            .data
            .read()
            .map_err(|e| PlacementError::Storage(e.to_string()))?;
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end.to_vec())
        };
        let result: Vec<_> = data
            .range::<Vec<u8>, _>((Bound::Included(start.to_vec()), upper))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), PlacementError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| PlacementError::Storage(e.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
