//! Region label rules.
//!
//! A label rule attaches key/value labels to every region overlapping its
//! key ranges. The labeler keeps the rules by id and a range index with one
//! entry per rule range; several entries share an id when a rule spans more
//! than one range.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::PlacementConfig;
use crate::range_index::{RangeIndex, RangeItem};
use crate::region::Region;
use crate::storage::RuleStorage;
use crate::types::{KeyRange, PlacementError, PlacementResult};

/// Prefix of raw-mode keyspace keys.
const RAW_KEYSPACE_PREFIX: u8 = b'r';
/// Prefix of transactional keyspace keys.
const TXN_KEYSPACE_PREFIX: u8 = b'x';
/// Keyspace ids are encoded in three bytes.
pub(crate) const MAX_KEYSPACE_ID: u32 = 0x00ff_ffff;

/// Interpretation of a label rule's `data` payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelRuleType {
    /// `data` is a list of hex-encoded `{start_key, end_key}` ranges.
    #[serde(rename = "key-range")]
    KeyRange,
}

/// One label attached to matching regions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionLabel {
    /// Label key.
    pub key: String,
    /// Label value.
    pub value: String,
}

impl RegionLabel {
    /// Creates a label.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Labels applied to every region overlapping the rule's ranges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelRule {
    /// Rule identifier.
    pub id: String,
    /// Labels, in declaration order.
    pub labels: Vec<RegionLabel>,
    /// Payload type.
    pub rule_type: LabelRuleType,
    /// Payload interpreted per `rule_type`.
    pub data: serde_json::Value,
}

impl LabelRule {
    /// Creates a `key-range` rule.
    pub fn key_range(id: impl Into<String>, labels: Vec<RegionLabel>, ranges: &[KeyRange]) -> Self {
        let data = ranges
            .iter()
            .map(|r| {
                json!({
                    "start_key": hex::encode(&r.start_key),
                    "end_key": hex::encode(&r.end_key),
                })
            })
            .collect();
        Self {
            id: id.into(),
            labels,
            rule_type: LabelRuleType::KeyRange,
            data: serde_json::Value::Array(data),
        }
    }

    /// Decodes the rule's key ranges from its payload.
    pub fn ranges(&self) -> PlacementResult<Vec<KeyRange>> {
        match self.rule_type {
            LabelRuleType::KeyRange => serde_json::from_value(self.data.clone()).map_err(|e| {
                PlacementError::Validation(format!(
                    "label rule '{}' has malformed key ranges: {}",
                    self.id, e
                ))
            }),
        }
    }

    /// Checks the id, labels and ranges. Returns the decoded ranges.
    pub fn validate(&self) -> PlacementResult<Vec<KeyRange>> {
        if self.id.is_empty() {
            return Err(PlacementError::Validation("label rule id is empty".into()));
        }
        if self.labels.is_empty() {
            return Err(PlacementError::Validation(format!(
                "label rule '{}' has no labels",
                self.id
            )));
        }
        if self.labels.iter().any(|l| l.key.is_empty()) {
            return Err(PlacementError::Validation(format!(
                "label rule '{}' has a label with an empty key",
                self.id
            )));
        }
        let ranges = self.ranges()?;
        if ranges.is_empty() {
            return Err(PlacementError::Validation(format!(
                "label rule '{}' has no key ranges",
                self.id
            )));
        }
        if let Some(bad) = ranges
            .iter()
            .find(|r| !r.is_unbounded() && r.start_key >= r.end_key)
        {
            return Err(PlacementError::Validation(format!(
                "label rule '{}' has an empty or inverted range {}",
                self.id, bad
            )));
        }
        Ok(ranges)
    }
}

/// Atomic batch of label rule edits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelRulePatch {
    /// Rules to insert or replace.
    #[serde(default)]
    pub set_rules: Vec<LabelRule>,
    /// Ids to remove; unknown ids are skipped.
    #[serde(default)]
    pub delete_rules: Vec<String>,
}

/// Label rule id reserved for a keyspace.
pub fn keyspace_rule_id(keyspace_id: u32) -> String {
    format!("keyspaces/{}", keyspace_id)
}

fn keyspace_bound(prefix: u8, keyspace_id: u32) -> Vec<u8> {
    if keyspace_id > MAX_KEYSPACE_ID {
        return vec![prefix + 1];
    }
    let [_, a, b, c] = keyspace_id.to_be_bytes();
    vec![prefix, a, b, c]
}

/// The label rule covering a keyspace's raw and transactional key ranges.
pub fn keyspace_label_rule(keyspace_id: u32) -> LabelRule {
    let ranges: Vec<KeyRange> = [RAW_KEYSPACE_PREFIX, TXN_KEYSPACE_PREFIX]
        .into_iter()
        .map(|prefix| {
            KeyRange::new(
                keyspace_bound(prefix, keyspace_id),
                keyspace_bound(prefix, keyspace_id.saturating_add(1)),
            )
        })
        .collect();
    LabelRule::key_range(
        keyspace_rule_id(keyspace_id),
        vec![RegionLabel::new("id", keyspace_id.to_string())],
        &ranges,
    )
}

/// A validated rule with its decoded ranges.
#[derive(Debug, PartialEq)]
struct CompiledRule {
    rule: LabelRule,
    ranges: Vec<KeyRange>,
}

impl CompiledRule {
    fn compile(rule: LabelRule) -> PlacementResult<Self> {
        let ranges = rule.validate()?;
        Ok(Self { rule, ranges })
    }
}

#[derive(Clone, Debug)]
struct LabelEntry {
    id: String,
    range: KeyRange,
}

impl RangeItem for LabelEntry {
    type Id = String;

    fn id(&self) -> &String {
        &self.id
    }

    fn start_key(&self) -> &[u8] {
        &self.range.start_key
    }

    fn end_key(&self) -> &[u8] {
        &self.range.end_key
    }
}

type LabelRules = BTreeMap<String, Arc<CompiledRule>>;

fn build_index(rules: &LabelRules) -> RangeIndex<LabelEntry> {
    RangeIndex::build(
        rules
            .iter()
            .flat_map(|(id, compiled)| {
                compiled.ranges.iter().map(move |range| LabelEntry {
                    id: id.clone(),
                    range: range.clone(),
                })
            })
            .collect(),
    )
}

#[derive(Default)]
struct LabelState {
    rules: LabelRules,
    index: RangeIndex<LabelEntry>,
}

/// Stores region label rules and resolves region labels.
pub struct RegionLabeler {
    storage: Arc<RuleStorage>,
    reserved_keyspace_id: u32,
    state: RwLock<LabelState>,
    commit: Mutex<()>,
}

impl RegionLabeler {
    /// Creates an empty labeler. Call [`RegionLabeler::load`] before use.
    pub fn new(storage: Arc<RuleStorage>, config: &PlacementConfig) -> Self {
        Self {
            storage,
            reserved_keyspace_id: config.reserved_keyspace_id,
            state: RwLock::new(LabelState::default()),
            commit: Mutex::new(()),
        }
    }

    fn reserved_id(&self) -> String {
        keyspace_rule_id(self.reserved_keyspace_id)
    }

    /// Loads label rules from the durable store and materializes the reserved
    /// keyspace rule when it is missing.
    pub fn load(&self) -> PlacementResult<()> {
        let _commit = self.commit.lock();
        let mut rules = LabelRules::new();
        for rule in self.storage.load_label_rules()? {
            let compiled = CompiledRule::compile(rule)?;
            rules.insert(compiled.rule.id.clone(), Arc::new(compiled));
        }

        let reserved = self.reserved_id();
        if !rules.contains_key(&reserved) {
            let rule = keyspace_label_rule(self.reserved_keyspace_id);
            let mut batch = self.storage.batch();
            batch.save_label_rule(&rule)?;
            self.storage.commit(batch)?;
            rules.insert(reserved.clone(), Arc::new(CompiledRule::compile(rule)?));
            tracing::info!("Materialized reserved label rule {}", reserved);
        }

        let index = build_index(&rules);
        tracing::info!("Loaded {} region label rules", rules.len());
        let mut state = self.state.write();
        state.rules = rules;
        state.index.replace_all(index);
        Ok(())
    }

    /// Applies `apply` to a copy of the rule map, persists the difference and
    /// swaps the result in. Returns the coalesced old and new ranges of every
    /// rule that changed.
    fn transact<F>(&self, apply: F) -> PlacementResult<Vec<KeyRange>>
    where
        F: FnOnce(&mut LabelRules) -> PlacementResult<()>,
    {
        let _commit = self.commit.lock();
        let current = self.state.read().rules.clone();
        let mut next = current.clone();
        apply(&mut next)?;

        let mut batch = self.storage.batch();
        let mut touched: Vec<KeyRange> = Vec::new();
        for (id, compiled) in &next {
            match current.get(id) {
                Some(old) if old == compiled => {}
                old => {
                    batch.save_label_rule(&compiled.rule)?;
                    touched.extend(compiled.ranges.iter().cloned());
                    if let Some(old) = old {
                        touched.extend(old.ranges.iter().cloned());
                    }
                }
            }
        }
        for (id, old) in current.iter().filter(|(id, _)| !next.contains_key(*id)) {
            batch.delete_label_rule(id);
            touched.extend(old.ranges.iter().cloned());
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let index = build_index(&next);
        self.storage.commit(batch)?;
        let mut state = self.state.write();
        state.rules = next;
        state.index.replace_all(index);
        Ok(KeyRange::coalesce(touched))
    }

    /// Inserts or replaces a label rule.
    pub fn set_label_rule(&self, rule: LabelRule) -> PlacementResult<Vec<KeyRange>> {
        let compiled = CompiledRule::compile(rule)?;
        tracing::debug!("Setting region label rule {}", compiled.rule.id);
        self.transact(|rules| {
            rules.insert(compiled.rule.id.clone(), Arc::new(compiled));
            Ok(())
        })
    }

    /// Removes a label rule. Deleting the reserved keyspace rule does nothing.
    pub fn delete_label_rule(&self, id: &str) -> PlacementResult<Vec<KeyRange>> {
        if id == self.reserved_id() {
            tracing::debug!("Ignoring delete of reserved label rule {}", id);
            return Ok(Vec::new());
        }
        tracing::debug!("Deleting region label rule {}", id);
        self.transact(|rules| {
            rules
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| PlacementError::LabelRuleNotFound(id.to_string()))
        })
    }

    /// Applies deletes, then sets, as one commit.
    pub fn patch(&self, patch: LabelRulePatch) -> PlacementResult<Vec<KeyRange>> {
        let mut ids = HashSet::new();
        for rule in &patch.set_rules {
            if !ids.insert(rule.id.as_str()) {
                return Err(PlacementError::Validation(format!(
                    "label rule '{}' appears twice in the patch",
                    rule.id
                )));
            }
        }
        let compiled = patch
            .set_rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<PlacementResult<Vec<_>>>()?;
        let reserved = self.reserved_id();
        let changed = self.transact(|rules| {
            for id in patch.delete_rules.iter().filter(|id| **id != reserved) {
                rules.remove(id);
            }
            for rule in compiled {
                rules.insert(rule.rule.id.clone(), Arc::new(rule));
            }
            Ok(())
        })?;
        tracing::info!("Patched region label rules, {} ranges changed", changed.len());
        Ok(changed)
    }

    /// Looks up one label rule.
    pub fn get_label_rule(&self, id: &str) -> Option<LabelRule> {
        self.state.read().rules.get(id).map(|c| c.rule.clone())
    }

    /// Every label rule, ordered by id.
    pub fn get_all_label_rules(&self) -> Vec<LabelRule> {
        self.state
            .read()
            .rules
            .values()
            .map(|c| c.rule.clone())
            .collect()
    }

    /// The requested label rules in request order; unknown ids are omitted.
    pub fn get_label_rules_by_ids(&self, ids: &[String]) -> Vec<LabelRule> {
        let state = self.state.read();
        ids.iter()
            .filter_map(|id| state.rules.get(id))
            .map(|c| c.rule.clone())
            .collect()
    }

    /// Labels of a region. Rules overlapping the region apply in ascending id
    /// order, so a later id wins a shared key.
    pub fn get_region_labels(&self, region: &Region) -> BTreeMap<String, String> {
        let state = self.state.read();
        let ids: BTreeSet<&String> = state
            .index
            .overlap_query(&region.start_key, &region.end_key)
            .into_iter()
            .map(|e| &e.id)
            .collect();
        let mut labels = BTreeMap::new();
        for compiled in ids.into_iter().filter_map(|id| state.rules.get(id)) {
            for label in &compiled.rule.labels {
                labels.insert(label.key.clone(), label.value.clone());
            }
        }
        labels
    }

    /// Value of one label of a region.
    pub fn get_region_label(&self, region: &Region, key: &str) -> Option<String> {
        self.get_region_labels(region).remove(key)
    }
}
