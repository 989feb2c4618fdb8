//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keyspan_placement::{
    BatchOp, KvStore, MemoryKvStore, MemoryRegionDirectory, PlacementConfig, PlacementEngine,
    PlacementError, Region,
};

/// KV store whose batch writes can be switched to fail.
pub struct FlakyKvStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
}

impl FlakyKvStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryKvStore::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent batch write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl KvStore for FlakyKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PlacementError> {
        self.inner.get(key)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), PlacementError> {
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), PlacementError> {
        self.inner.delete(key)
    }

    fn scan_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PlacementError> {
        self.inner.scan_range(start, end, limit)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), PlacementError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PlacementError::Storage("injected write failure".into()));
        }
        self.inner.write_batch(ops)
    }
}

/// An engine over in-memory backends plus handles to them.
pub struct TestEngine {
    pub engine: PlacementEngine,
    pub store: Arc<FlakyKvStore>,
    pub regions: Arc<MemoryRegionDirectory>,
}

impl TestEngine {
    /// Bootstraps an engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(PlacementConfig::default())
    }

    pub fn with_config(config: PlacementConfig) -> Self {
        let store = Arc::new(FlakyKvStore::new());
        let regions = Arc::new(MemoryRegionDirectory::new());
        let engine = PlacementEngine::bootstrap(config, store.clone(), regions.clone())
            .expect("bootstrap");
        Self {
            engine,
            store,
            regions,
        }
    }

    /// Registers regions given as `(id, start, end)`.
    pub fn with_regions(self, regions: &[(u64, &str, &str)]) -> Self {
        for (id, start, end) in regions {
            self.regions
                .upsert(Region::new(*id, start.as_bytes().to_vec(), end.as_bytes().to_vec()));
        }
        self
    }

    /// Bootstraps a second engine over the same durable store.
    pub fn reopen(&self) -> PlacementEngine {
        PlacementEngine::bootstrap(
            self.engine.config().clone(),
            self.store.clone(),
            self.regions.clone(),
        )
        .expect("reopen")
    }
}
