//! Region directory and store label inventory seams.
//!
//! Both are owned by other subsystems (heartbeat ingestion and store
//! bookkeeping). The engine only reads through these traits; the memory
//! implementations back tests and the command-line tool.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::range_index::{RangeIndex, RangeItem};
use crate::types::{hex_key, KeyRange, RegionId, Role, StoreId};

/// A label attached to a store, e.g. `zone=z1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreLabel {
    /// Label key.
    pub key: String,
    /// Label value.
    pub value: String,
}

impl StoreLabel {
    /// Creates a store label.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A single replica of a region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Store hosting the replica.
    pub store_id: StoreId,
    /// Current role of the replica.
    pub role: Role,
}

impl Peer {
    /// Creates a peer.
    pub fn new(store_id: u64, role: Role) -> Self {
        Self {
            store_id: StoreId::new(store_id),
            role,
        }
    }
}

/// A region as reported by the region directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// Region identifier.
    pub id: RegionId,
    /// Inclusive start key.
    #[serde(default, with = "hex_key")]
    pub start_key: Vec<u8>,
    /// Exclusive end key; empty means unbounded.
    #[serde(default, with = "hex_key")]
    pub end_key: Vec<u8>,
    /// Current replicas.
    #[serde(default)]
    pub peers: Vec<Peer>,
}

impl Region {
    /// Creates a region with no peers.
    pub fn new(id: u64, start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            id: RegionId::new(id),
            start_key: start_key.into(),
            end_key: end_key.into(),
            peers: Vec::new(),
        }
    }

    /// Adds a peer, builder style.
    pub fn with_peer(mut self, store_id: u64, role: Role) -> Self {
        self.peers.push(Peer::new(store_id, role));
        self
    }

    /// The region's key range.
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.start_key.clone(), self.end_key.clone())
    }
}

impl RangeItem for Region {
    type Id = RegionId;

    fn id(&self) -> &RegionId {
        &self.id
    }

    fn start_key(&self) -> &[u8] {
        &self.start_key
    }

    fn end_key(&self) -> &[u8] {
        &self.end_key
    }
}

/// Read-only view of the cluster's region tree.
pub trait RegionDirectory: Send + Sync {
    /// Identifiers of every region intersecting `range`.
    fn regions_in_range(&self, range: &KeyRange) -> Vec<RegionId>;

    /// Looks up a region by id.
    fn region(&self, id: RegionId) -> Option<Region>;
}

/// Read-only view of store labels.
pub trait StoreLabelInventory: Send + Sync {
    /// Labels of a store; unknown stores have none.
    fn store_labels(&self, store_id: StoreId) -> Vec<StoreLabel>;
}

/// Region tree held in memory.
#[derive(Default)]
pub struct MemoryRegionDirectory {
    regions: RwLock<RangeIndex<Region>>,
}

impl MemoryRegionDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a region. Regions it now overlaps are dropped, the
    /// way a heartbeat for a freshly split or merged region replaces stale
    /// entries.
    pub fn upsert(&self, region: Region) {
        let mut regions = self.regions.write();
        let stale: Vec<RegionId> = regions
            .overlap_query(&region.start_key, &region.end_key)
            .into_iter()
            .map(|r| r.id)
            .filter(|id| *id != region.id)
            .collect();
        for id in stale {
            regions.delete(&id);
        }
        regions.upsert(region);
    }

    /// Number of known regions.
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Returns true if no region is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegionDirectory for MemoryRegionDirectory {
    fn regions_in_range(&self, range: &KeyRange) -> Vec<RegionId> {
        self.regions
            .read()
            .overlap_query(&range.start_key, &range.end_key)
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    fn region(&self, id: RegionId) -> Option<Region> {
        self.regions.read().iter().find(|r| r.id == id).cloned()
    }
}

/// Store labels held in memory.
#[derive(Default)]
pub struct MemoryStoreLabels {
    stores: RwLock<HashMap<StoreId, Vec<StoreLabel>>>,
}

impl MemoryStoreLabels {
    /// Creates an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the labels of a store.
    pub fn put_store(&self, store_id: StoreId, labels: Vec<StoreLabel>) {
        self.stores.write().insert(store_id, labels);
    }
}

impl StoreLabelInventory for MemoryStoreLabels {
    fn store_labels(&self, store_id: StoreId) -> Vec<StoreLabel> {
        self.stores
            .read()
            .get(&store_id)
            .cloned()
            .unwrap_or_default()
    }
}
