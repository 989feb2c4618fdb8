use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Represents a unique identifier for a region (a contiguous key range and its replicas)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(u64);

impl RegionId {
    /// Creates a new RegionId from a raw u64 value
    pub fn new(id: u64) -> Self {
        RegionId(id)
    }

    /// Returns the raw u64 value of this region ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a unique identifier for a storage node hosting peers
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(u64);

impl StoreId {
    /// Creates a new StoreId from a raw u64 value
    pub fn new(id: u64) -> Self {
        StoreId(id)
    }

    /// Returns the raw u64 value of this store ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replica role, used both by placement rules and by region peers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Any voting replica (leader or follower).
    Voter,
    /// The Raft leader.
    Leader,
    /// A voting replica that is not the leader.
    Follower,
    /// A non-voting replica.
    Learner,
}

impl Role {
    /// Returns true if a peer holding `peer` can fill a rule slot of this role.
    pub fn accepts(self, peer: Role) -> bool {
        match self {
            Role::Voter => matches!(peer, Role::Voter | Role::Leader | Role::Follower),
            Role::Leader => peer == Role::Leader,
            Role::Follower => matches!(peer, Role::Follower | Role::Voter),
            Role::Learner => peer == Role::Learner,
        }
    }

    /// Matching order: narrower roles claim peers before the broad Voter role.
    pub(crate) fn specificity(self) -> u8 {
        match self {
            Role::Leader => 0,
            Role::Follower => 1,
            Role::Learner => 2,
            Role::Voter => 3,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Voter => "voter",
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Learner => "learner",
        };
        f.write_str(name)
    }
}

/// A half-open key range `[start_key, end_key)`. An empty `end_key` is unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    #[serde(default, with = "hex_key")]
    pub start_key: Vec<u8>,
    /// Exclusive upper bound; empty means the end of the key space.
    #[serde(default, with = "hex_key")]
    pub end_key: Vec<u8>,
}

impl KeyRange {
    /// Creates a range from raw bounds.
    pub fn new(start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            start_key: start_key.into(),
            end_key: end_key.into(),
        }
    }

    /// The whole key space.
    pub fn whole() -> Self {
        Self::default()
    }

    /// Returns true if the range has no upper bound.
    pub fn is_unbounded(&self) -> bool {
        self.end_key.is_empty()
    }

    /// Returns true if `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.start_key.as_slice() <= key && end_after(&self.end_key, key)
    }

    /// Returns true if the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        ranges_intersect(
            &self.start_key,
            &self.end_key,
            &other.start_key,
            &other.end_key,
        )
    }

    /// Merges overlapping and adjacent ranges into a sorted, disjoint list.
    pub fn coalesce(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
        ranges.sort_by(|a, b| a.start_key.cmp(&b.start_key));
        let mut merged: Vec<KeyRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if let Some(last) = merged.last_mut() {
                if last.is_unbounded() {
                    continue;
                }
                if range.start_key <= last.end_key {
                    if range.is_unbounded() || range.end_key > last.end_key {
                        last.end_key = range.end_key;
                    }
                    continue;
                }
            }
            merged.push(range);
        }
        merged
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            hex::encode(&self.start_key),
            hex::encode(&self.end_key)
        )
    }
}

/// Returns true if an exclusive end bound lies strictly after `key`.
pub(crate) fn end_after(end_key: &[u8], key: &[u8]) -> bool {
    end_key.is_empty() || end_key > key
}

/// Intersection test for two half-open ranges with unbounded empty ends.
pub(crate) fn ranges_intersect(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    end_after(b_end, a_start) && end_after(a_end, b_start)
}

/// Serde adapter storing raw keys as lowercase hex strings.
pub(crate) mod hex_key {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(D::Error::custom)
    }
}

/// Result type alias for placement engine operations.
pub type PlacementResult<T> = Result<T, PlacementError>;

/// Error variants for the placement engine.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// A submitted rule, group, bundle or label rule is malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested placement rule does not exist.
    #[error("rule {group_id}/{id} not found")]
    RuleNotFound {
        /// Group of the missing rule
        group_id: String,
        /// Identifier of the missing rule
        id: String,
    },

    /// The requested rule group has no configuration record.
    #[error("rule group {0} not found")]
    RuleGroupNotFound(String),

    /// The requested region label rule does not exist.
    #[error("region label rule {0} not found")]
    LabelRuleNotFound(String),

    /// The engine configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error occurred in the durable metadata store.
    #[error("storage error: {0}")]
    Storage(String),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A group pattern failed to compile.
    #[error("invalid group pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}
