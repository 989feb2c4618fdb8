#![warn(missing_docs)]

//! Keyspan placement subsystem: placement rules, region labels and
//! suspect-region rescheduling

pub mod bundle;
pub mod cli;
pub mod config;
pub mod engine;
pub mod kvstore;
pub mod labeler;
pub mod placement;
pub mod range_index;
pub mod region;
pub mod storage;
pub mod suspect;
pub mod types;

pub use bundle::BundleController;
pub use config::PlacementConfig;
pub use engine::PlacementEngine;
pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use labeler::{LabelRule, LabelRulePatch, LabelRuleType, RegionLabel, RegionLabeler};
pub use placement::{
    Coverage, GroupBundle, LabelConstraint, LabelConstraintOp, Rule, RuleFit, RuleGroup, RuleKey,
    RuleManager, RuleOp, RuleOpAction, RuleSegment, UnsatisfiedRule,
};
pub use range_index::{RangeIndex, RangeItem};
pub use region::{
    MemoryRegionDirectory, MemoryStoreLabels, Peer, Region, RegionDirectory, StoreLabel,
    StoreLabelInventory,
};
pub use storage::RuleStorage;
pub use suspect::SuspectRegions;
pub use types::{KeyRange, PlacementError, PlacementResult, RegionId, Role, StoreId};
