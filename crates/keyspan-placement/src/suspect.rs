//! Suspect regions: regions whose placement may no longer satisfy the rules
//! and should be checked by the scheduler ahead of its normal scan.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::types::RegionId;

/// Set of region ids awaiting an accelerated placement check.
#[derive(Debug, Default)]
pub struct SuspectRegions {
    regions: RwLock<HashSet<RegionId>>,
}

impl SuspectRegions {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks regions as suspect. Returns how many were newly added.
    pub fn add<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = RegionId>,
    {
        let mut regions = self.regions.write();
        let added = ids.into_iter().filter(|id| regions.insert(*id)).count();
        if added > 0 {
            tracing::debug!("Marked {} regions suspect, {} pending", added, regions.len());
        }
        added
    }

    /// Unmarks one region. Returns true if it was suspect.
    pub fn remove(&self, id: RegionId) -> bool {
        self.regions.write().remove(&id)
    }

    /// Returns every suspect region in ascending id order and clears the set.
    pub fn drain(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self.regions.write().drain().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns true if the region is suspect.
    pub fn contains(&self, id: RegionId) -> bool {
        self.regions.read().contains(&id)
    }

    /// Unmarks every region.
    pub fn clear(&self) {
        self.regions.write().clear();
    }

    /// Suspect regions in ascending id order, leaving the set untouched.
    pub fn snapshot(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self.regions.read().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of suspect regions.
    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    /// Returns true if no region is suspect.
    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}
