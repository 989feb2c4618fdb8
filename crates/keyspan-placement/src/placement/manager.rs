//! Placement rule manager.
//!
//! Owns every rule and rule group, the per-rule range index and the merged
//! segment index derived from them. Writers stage a complete next
//! configuration, persist it, then swap both indexes under one write lock;
//! readers only ever see a whole configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::Regex;

use crate::bundle;
use crate::config::PlacementConfig;
use crate::placement::fit::{self, RuleFit};
use crate::placement::rule::{
    GroupBundle, Rule, RuleGroup, RuleKey, RuleOp, DEFAULT_GROUP_ID, DEFAULT_RULE_ID,
};
use crate::range_index::{RangeIndex, RangeItem};
use crate::region::{Region, StoreLabelInventory};
use crate::storage::{RuleBatch, RuleStorage};
use crate::types::{end_after, KeyRange, PlacementError, PlacementResult, Role};

/// How a commit treats key space left without any merged rule.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Coverage {
    /// Reject a change to the reserved default rule or group that uncovers keys.
    #[default]
    Enforce,
    /// Accept the gap; it is logged as a misconfiguration.
    AllowGaps,
}

/// The rule universe: every rule plus every explicit group record.
#[derive(Clone, Debug, Default)]
pub(crate) struct RuleConfig {
    pub(crate) rules: BTreeMap<RuleKey, Arc<Rule>>,
    pub(crate) groups: BTreeMap<String, RuleGroup>,
}

impl RuleConfig {
    pub(crate) fn upsert_rule(&mut self, rule: Rule) {
        self.rules.insert(rule.key(), Arc::new(rule));
    }

    /// Drops a group record and all of its rules.
    pub(crate) fn remove_group(&mut self, group_id: &str) {
        self.groups.remove(group_id);
        self.rules.retain(|k, _| k.group_id != group_id);
    }

    pub(crate) fn clear(&mut self) {
        self.rules.clear();
        self.groups.clear();
    }

    fn group(&self, group_id: &str) -> RuleGroup {
        self.groups
            .get(group_id)
            .cloned()
            .unwrap_or_else(|| RuleGroup::implicit(group_id))
    }

    /// Groups in fold order with their rules ordered by id.
    fn ordered_groups(&self) -> Vec<(RuleGroup, Vec<Arc<Rule>>)> {
        let mut by_group: BTreeMap<&str, Vec<Arc<Rule>>> = self
            .groups
            .keys()
            .map(|id| (id.as_str(), Vec::new()))
            .collect();
        for (key, rule) in &self.rules {
            by_group
                .entry(key.group_id.as_str())
                .or_default()
                .push(rule.clone());
        }
        let mut ordered: Vec<(RuleGroup, Vec<Arc<Rule>>)> = by_group
            .into_iter()
            .map(|(id, rules)| (self.group(id), rules))
            .collect();
        ordered.sort_by(|(a, _), (b, _)| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
        ordered
    }

    fn bundles(&self) -> Vec<GroupBundle> {
        self.ordered_groups()
            .into_iter()
            .map(|(group, rules)| {
                GroupBundle::new(group, rules.iter().map(|r| r.as_ref().clone()).collect())
            })
            .collect()
    }

    /// Stages the record writes turning `self` into `next`.
    fn stage_changes(&self, next: &RuleConfig, batch: &mut RuleBatch<'_>) -> PlacementResult<()> {
        for (key, rule) in &next.rules {
            if self.rules.get(key) != Some(rule) {
                batch.save_rule(rule)?;
            }
        }
        for key in self.rules.keys().filter(|k| !next.rules.contains_key(*k)) {
            batch.delete_rule(&key.group_id, &key.id);
        }
        for (id, group) in &next.groups {
            if self.groups.get(id) != Some(group) {
                batch.save_rule_group(group)?;
            }
        }
        for id in self.groups.keys().filter(|id| !next.groups.contains_key(*id)) {
            batch.delete_rule_group(id);
        }
        Ok(())
    }

    fn touches_reserved(&self, next: &RuleConfig) -> bool {
        let key = RuleKey::default_rule();
        self.rules.get(&key) != next.rules.get(&key)
            || self.groups.get(DEFAULT_GROUP_ID) != next.groups.get(DEFAULT_GROUP_ID)
    }
}

/// Per-rule entry of the rule range index.
#[derive(Clone, Debug)]
struct RuleEntry {
    key: RuleKey,
    rule: Arc<Rule>,
}

impl RangeItem for RuleEntry {
    type Id = RuleKey;

    fn id(&self) -> &RuleKey {
        &self.key
    }

    fn start_key(&self) -> &[u8] {
        &self.rule.start_key
    }

    fn end_key(&self) -> &[u8] {
        &self.rule.end_key
    }
}

/// A maximal key range over which the merged rule list is constant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSegment {
    /// Inclusive start key.
    pub start_key: Vec<u8>,
    /// Exclusive end key; empty means unbounded.
    pub end_key: Vec<u8>,
    /// Rules governing the segment, in fold order.
    pub rules: Vec<Arc<Rule>>,
}

impl RangeItem for RuleSegment {
    type Id = Vec<u8>;

    fn id(&self) -> &Vec<u8> {
        &self.start_key
    }

    fn start_key(&self) -> &[u8] {
        &self.start_key
    }

    fn end_key(&self) -> &[u8] {
        &self.end_key
    }
}

/// Cuts the key space at every rule boundary and folds the groups per piece.
///
/// Boundaries are swept in key order while tracking the rules active at the
/// current one, so each piece only folds the rules covering it. Active rules
/// are keyed by fold position: group position, then rule position within it.
fn build_segments(config: &RuleConfig) -> Vec<RuleSegment> {
    let groups = config.ordered_groups();
    let mut by_start: Vec<((usize, usize), &Arc<Rule>)> = groups
        .iter()
        .enumerate()
        .flat_map(|(g, (_, rules))| rules.iter().enumerate().map(move |(r, rule)| ((g, r), rule)))
        .collect();
    by_start.sort_by(|a, b| a.1.start_key.cmp(&b.1.start_key));
    let mut by_end: Vec<((usize, usize), &Arc<Rule>)> = by_start
        .iter()
        .filter(|(_, rule)| !rule.end_key.is_empty())
        .copied()
        .collect();
    by_end.sort_by(|a, b| a.1.end_key.cmp(&b.1.end_key));

    let mut bounds: Vec<&[u8]> = vec![&b""[..]];
    for (_, rule) in &by_start {
        bounds.push(&rule.start_key);
        if !rule.end_key.is_empty() {
            bounds.push(&rule.end_key);
        }
    }
    bounds.sort();
    bounds.dedup();

    let mut active: BTreeMap<(usize, usize), &Arc<Rule>> = BTreeMap::new();
    let (mut next_start, mut next_end) = (0, 0);
    let mut segments: Vec<RuleSegment> = Vec::new();
    for (i, start) in bounds.iter().enumerate() {
        let end: &[u8] = bounds.get(i + 1).copied().unwrap_or(b"");
        while let Some((pos, rule)) = by_end.get(next_end) {
            if rule.end_key.as_slice() > *start {
                break;
            }
            active.remove(pos);
            next_end += 1;
        }
        while let Some((pos, rule)) = by_start.get(next_start) {
            if rule.start_key.as_slice() > *start {
                break;
            }
            if end_after(&rule.end_key, start) {
                active.insert(*pos, *rule);
            }
            next_start += 1;
        }

        let mut merged: Vec<Arc<Rule>> = Vec::new();
        let mut group = None;
        for (&(g, _), rule) in &active {
            if group != Some(g) {
                group = Some(g);
                if groups[g].0.is_override {
                    merged.clear();
                }
            }
            merged.push(Arc::clone(rule));
        }
        if merged.is_empty() {
            continue;
        }
        if let Some(last) = segments.last_mut() {
            if last.end_key.as_slice() == *start && last.rules == merged {
                last.end_key = end.to_vec();
                continue;
            }
        }
        segments.push(RuleSegment {
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            rules: merged,
        });
    }
    segments
}

fn is_fully_covered(merged: &RangeIndex<RuleSegment>) -> bool {
    let mut expected: &[u8] = b"";
    let mut iter = merged.iter().peekable();
    while let Some(segment) = iter.next() {
        if segment.start_key.as_slice() != expected {
            return false;
        }
        if segment.end_key.is_empty() {
            return iter.peek().is_none();
        }
        expected = &segment.end_key;
    }
    false
}

/// Key ranges whose merged rule list differs between two segment indexes.
fn diff_segments(old: &RangeIndex<RuleSegment>, new: &RangeIndex<RuleSegment>) -> Vec<KeyRange> {
    let mut bounds: Vec<&[u8]> = vec![&b""[..]];
    for segment in old.iter().chain(new.iter()) {
        bounds.push(&segment.start_key);
        if !segment.end_key.is_empty() {
            bounds.push(&segment.end_key);
        }
    }
    bounds.sort();
    bounds.dedup();

    let rules_at = |index: &RangeIndex<RuleSegment>, key: &[u8]| {
        index.point_query(key).first().map(|s| s.rules.clone())
    };
    let mut changed: Vec<KeyRange> = Vec::new();
    for (i, start) in bounds.iter().enumerate() {
        let end: &[u8] = bounds.get(i + 1).copied().unwrap_or(b"");
        if rules_at(old, *start) == rules_at(new, *start) {
            continue;
        }
        match changed.last_mut() {
            Some(last) if last.end_key.as_slice() == *start => last.end_key = end.to_vec(),
            _ => changed.push(KeyRange::new(start.to_vec(), end.to_vec())),
        }
    }
    changed
}

struct RuleState {
    config: RuleConfig,
    rules: RangeIndex<RuleEntry>,
    merged: RangeIndex<RuleSegment>,
}

impl RuleState {
    fn empty() -> Self {
        Self {
            config: RuleConfig::default(),
            rules: RangeIndex::new(),
            merged: RangeIndex::new(),
        }
    }
}

/// Stores placement rules and evaluates regions against them.
pub struct RuleManager {
    storage: Arc<RuleStorage>,
    default_rule: Rule,
    state: RwLock<RuleState>,
    /// Serializes writers across build, persist and swap.
    commit: Mutex<()>,
}

impl RuleManager {
    /// Creates an empty manager. Call [`RuleManager::load`] before use.
    pub fn new(storage: Arc<RuleStorage>, config: &PlacementConfig) -> Self {
        let count = i32::try_from(config.default_replica_count).unwrap_or(i32::MAX);
        let default_rule = Rule::new(DEFAULT_GROUP_ID, DEFAULT_RULE_ID, Role::Voter, count)
            .with_isolation_level(config.default_isolation_level.clone());
        Self {
            storage,
            default_rule,
            state: RwLock::new(RuleState::empty()),
            commit: Mutex::new(()),
        }
    }

    /// Loads rules and groups from the durable store. An empty store gets the
    /// reserved default rule, which is persisted.
    pub fn load(&self) -> PlacementResult<()> {
        let _commit = self.commit.lock();
        let mut config = RuleConfig::default();
        for group in self.storage.load_rule_groups()? {
            group.validate()?;
            config.groups.insert(group.id.clone(), group);
        }
        for rule in self.storage.load_rules()? {
            rule.validate()?;
            config.upsert_rule(rule);
        }

        if config.rules.is_empty() && config.groups.is_empty() {
            let mut batch = self.storage.batch();
            batch.save_rule(&self.default_rule)?;
            self.storage.commit(batch)?;
            config.upsert_rule(self.default_rule.clone());
            tracing::info!("Materialized default placement rule {}", self.default_rule.key());
        }

        let rules = RangeIndex::build(entries(&config));
        let merged = RangeIndex::build(build_segments(&config));
        if !is_fully_covered(&merged) {
            tracing::warn!("Loaded placement rules leave part of the key space uncovered");
        }
        tracing::info!(
            "Loaded {} placement rules in {} groups",
            config.rules.len(),
            config.ordered_groups().len()
        );

        let mut state = self.state.write();
        state.config = config;
        state.rules.replace_all(rules);
        state.merged.replace_all(merged);
        Ok(())
    }

    /// Applies `apply` to a copy of the configuration and commits the result.
    ///
    /// The durable store is written before the in-memory swap; any error
    /// leaves both untouched. Returns the key ranges whose merged rules changed.
    pub(crate) fn transact<F>(&self, coverage: Coverage, apply: F) -> PlacementResult<Vec<KeyRange>>
    where
        F: FnOnce(&mut RuleConfig) -> PlacementResult<()>,
    {
        let _commit = self.commit.lock();
        let current = self.state.read().config.clone();
        let mut next = current.clone();
        apply(&mut next)?;

        let mut batch = self.storage.batch();
        current.stage_changes(&next, &mut batch)?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let rules = RangeIndex::build(entries(&next));
        let merged = RangeIndex::build(build_segments(&next));
        if !is_fully_covered(&merged) && current.touches_reserved(&next) {
            match coverage {
                Coverage::Enforce => {
                    return Err(PlacementError::Validation(
                        "change to the default rule leaves key space without placement rules"
                            .into(),
                    ))
                }
                Coverage::AllowGaps => {
                    tracing::warn!("Placement rules no longer cover the whole key space")
                }
            }
        }
        let changed = diff_segments(&self.state.read().merged, &merged);

        self.storage.commit(batch)?;
        let mut state = self.state.write();
        state.config = next;
        state.rules.replace_all(rules);
        state.merged.replace_all(merged);
        Ok(changed)
    }

    /// Inserts or replaces a rule.
    pub fn set_rule(&self, rule: Rule) -> PlacementResult<Vec<KeyRange>> {
        rule.validate()?;
        tracing::debug!("Setting placement rule {}", rule.key());
        self.transact(Coverage::Enforce, |config| {
            config.upsert_rule(rule);
            Ok(())
        })
    }

    /// Removes a rule; a missing rule is an error.
    pub fn delete_rule(&self, group_id: &str, id: &str) -> PlacementResult<Vec<KeyRange>> {
        tracing::debug!("Deleting placement rule {}/{}", group_id, id);
        self.transact(Coverage::Enforce, |config| {
            config
                .rules
                .remove(&RuleKey::new(group_id, id))
                .map(|_| ())
                .ok_or_else(|| PlacementError::RuleNotFound {
                    group_id: group_id.to_string(),
                    id: id.to_string(),
                })
        })
    }

    /// Inserts or replaces a rule group record.
    pub fn set_rule_group(&self, group: RuleGroup) -> PlacementResult<Vec<KeyRange>> {
        group.validate()?;
        tracing::debug!(
            "Setting rule group {} (index {}, override {})",
            group.id,
            group.index,
            group.is_override
        );
        self.transact(Coverage::Enforce, |config| {
            config.groups.insert(group.id.clone(), group);
            Ok(())
        })
    }

    /// Removes a rule group record. Its rules stay and fall back to the
    /// implicit group configuration.
    pub fn delete_rule_group(&self, group_id: &str) -> PlacementResult<Vec<KeyRange>> {
        tracing::debug!("Deleting rule group {}", group_id);
        self.transact(Coverage::Enforce, |config| {
            config
                .groups
                .remove(group_id)
                .map(|_| ())
                .ok_or_else(|| PlacementError::RuleGroupNotFound(group_id.to_string()))
        })
    }

    /// Replaces the given groups, or with `full_replace` the whole rule universe.
    pub fn set_bundles(
        &self,
        bundles: Vec<GroupBundle>,
        full_replace: bool,
        coverage: Coverage,
    ) -> PlacementResult<Vec<KeyRange>> {
        let bundles = bundle::validate_bundles(bundles)?;
        let count = bundles.len();
        let changed = self.transact(coverage, |config| {
            bundle::apply_bundles(config, bundles, full_replace);
            Ok(())
        })?;
        tracing::info!(
            "Committed {} rule bundles (full replace: {}), {} ranges changed",
            count,
            full_replace,
            changed.len()
        );
        Ok(changed)
    }

    /// Replaces one group.
    pub fn set_group_bundle(&self, bundle: GroupBundle, coverage: Coverage) -> PlacementResult<Vec<KeyRange>> {
        self.set_bundles(vec![bundle], false, coverage)
    }

    /// Removes the group `id` with its rules, or with `regex` every group
    /// whose id matches the pattern.
    pub fn delete_group_bundle(
        &self,
        id: &str,
        regex: bool,
        coverage: Coverage,
    ) -> PlacementResult<Vec<KeyRange>> {
        let pattern = if regex { Some(Regex::new(id)?) } else { None };
        self.transact(coverage, |config| {
            let targets: Vec<String> = config
                .ordered_groups()
                .into_iter()
                .map(|(group, _)| group.id)
                .filter(|g| match &pattern {
                    Some(p) => p.is_match(g),
                    None => g == id,
                })
                .collect();
            for group_id in &targets {
                config.remove_group(group_id);
            }
            tracing::debug!("Deleting rule groups {:?}", targets);
            Ok(())
        })
    }

    /// Applies a batch of rule edits atomically.
    pub fn apply_rule_ops(&self, ops: Vec<RuleOp>, coverage: Coverage) -> PlacementResult<Vec<KeyRange>> {
        let count = ops.len();
        let changed = self.transact(coverage, |config| bundle::apply_rule_ops(config, ops))?;
        tracing::info!("Applied {} rule ops, {} ranges changed", count, changed.len());
        Ok(changed)
    }

    /// Looks up one rule.
    pub fn get_rule(&self, group_id: &str, id: &str) -> Option<Rule> {
        self.state
            .read()
            .config
            .rules
            .get(&RuleKey::new(group_id, id))
            .map(|r| r.as_ref().clone())
    }

    /// Every rule, ordered by group id then rule id.
    pub fn get_all_rules(&self) -> Vec<Rule> {
        self.state
            .read()
            .config
            .rules
            .values()
            .map(|r| r.as_ref().clone())
            .collect()
    }

    /// Rules of one group, ordered by id.
    pub fn get_rules_by_group(&self, group_id: &str) -> Vec<Rule> {
        self.state
            .read()
            .config
            .rules
            .iter()
            .filter(|(k, _)| k.group_id == group_id)
            .map(|(_, r)| r.as_ref().clone())
            .collect()
    }

    /// Rules whose own range intersects `range`, before merging.
    pub fn get_rules_for_range(&self, range: &KeyRange) -> Vec<Rule> {
        self.state
            .read()
            .rules
            .overlap_query(&range.start_key, &range.end_key)
            .into_iter()
            .map(|e| e.rule.as_ref().clone())
            .collect()
    }

    /// Merged rules governing `key`.
    pub fn get_rules_by_key(&self, key: &[u8]) -> Vec<Rule> {
        self.state
            .read()
            .merged
            .point_query(key)
            .first()
            .map(|s| s.rules.iter().map(|r| r.as_ref().clone()).collect())
            .unwrap_or_default()
    }

    /// The merged segments, in key order.
    pub fn get_segments(&self) -> Vec<RuleSegment> {
        self.state.read().merged.iter().cloned().collect()
    }

    /// Returns true if every key is governed by at least one merged rule.
    pub fn is_fully_covered(&self) -> bool {
        is_fully_covered(&self.state.read().merged)
    }

    /// The configuration of a group that has a record or rules.
    pub fn get_rule_group(&self, group_id: &str) -> PlacementResult<RuleGroup> {
        let state = self.state.read();
        let config = &state.config;
        if let Some(group) = config.groups.get(group_id) {
            return Ok(group.clone());
        }
        if config.rules.keys().any(|k| k.group_id == group_id) {
            return Ok(RuleGroup::implicit(group_id));
        }
        Err(PlacementError::RuleGroupNotFound(group_id.to_string()))
    }

    /// Every group, in fold order.
    pub fn get_all_rule_groups(&self) -> Vec<RuleGroup> {
        self.state
            .read()
            .config
            .ordered_groups()
            .into_iter()
            .map(|(group, _)| group)
            .collect()
    }

    /// Every group with its rules, in fold order.
    pub fn get_all_bundles(&self) -> Vec<GroupBundle> {
        self.state.read().config.bundles()
    }

    /// One group with its rules.
    pub fn get_group_bundle(&self, group_id: &str) -> PlacementResult<GroupBundle> {
        let group = self.get_rule_group(group_id)?;
        Ok(GroupBundle::new(group, self.get_rules_by_group(group_id)))
    }

    /// Evaluates a region's peers against the merged rules covering its range.
    ///
    /// The rules are copied under the read lock; store labels are fetched
    /// after it is released, so the result may lag a concurrent write.
    pub fn fit_region(&self, region: &Region, stores: &dyn StoreLabelInventory) -> RuleFit {
        let (rules, cross_range) = {
            let state = self.state.read();
            let segments = state
                .merged
                .overlap_query(&region.start_key, &region.end_key);
            let mut seen = BTreeSet::new();
            let rules: Vec<Arc<Rule>> = segments
                .iter()
                .flat_map(|s| s.rules.iter())
                .filter(|r| seen.insert(r.key()))
                .cloned()
                .collect();
            (rules, segments.len() > 1)
        };
        fit::fit_region(region, &rules, stores, cross_range)
    }
}

fn entries(config: &RuleConfig) -> Vec<RuleEntry> {
    config
        .rules
        .iter()
        .map(|(key, rule)| RuleEntry {
            key: key.clone(),
            rule: rule.clone(),
        })
        .collect()
}
