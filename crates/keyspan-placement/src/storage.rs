//! Placement records in the durable metadata store.
//!
//! Layout under the configured root:
//! `rules/{hex(group_id)}-{hex(id)}`, `rule_group/{group_id}` and
//! `region_label/{id}`, each holding the record's JSON encoding. Rule keys are
//! hex-encoded so that ids containing `-` cannot collide.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::PlacementConfig;
use crate::kvstore::{BatchOp, KvStore};
use crate::labeler::LabelRule;
use crate::placement::rule::{Rule, RuleGroup};
use crate::types::PlacementResult;

const RULES_PATH: &str = "rules";
const RULE_GROUP_PATH: &str = "rule_group";
const REGION_LABEL_PATH: &str = "region_label";

/// Smallest key strictly greater than every key starting with `prefix`.
/// Empty when no such key exists.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    end
}

/// Reads and writes placement records.
pub struct RuleStorage {
    kv: Arc<dyn KvStore>,
    root: String,
    page_size: usize,
}

impl RuleStorage {
    /// Creates an endpoint over `kv` rooted at `config.key_root`.
    pub fn new(kv: Arc<dyn KvStore>, config: &PlacementConfig) -> Self {
        Self {
            kv,
            root: config.key_root.trim_end_matches('/').to_string(),
            page_size: config.load_page_size.max(1),
        }
    }

    fn path(&self, kind: &str, name: &str) -> Vec<u8> {
        format!("{}/{}/{}", self.root, kind, name).into_bytes()
    }

    fn rule_path(&self, group_id: &str, id: &str) -> Vec<u8> {
        let name = format!("{}-{}", hex::encode(group_id), hex::encode(id));
        self.path(RULES_PATH, &name)
    }

    /// Loads every stored rule.
    pub fn load_rules(&self) -> PlacementResult<Vec<Rule>> {
        self.load_all(RULES_PATH)
    }

    /// Loads every stored rule group.
    pub fn load_rule_groups(&self) -> PlacementResult<Vec<RuleGroup>> {
        self.load_all(RULE_GROUP_PATH)
    }

    /// Loads every stored region label rule.
    pub fn load_label_rules(&self) -> PlacementResult<Vec<LabelRule>> {
        self.load_all(REGION_LABEL_PATH)
    }

    fn load_all<T: DeserializeOwned>(&self, kind: &str) -> PlacementResult<Vec<T>> {
        let mut records = Vec::new();
        for (_, raw) in self.load_range_by_prefix(kind)? {
            records.push(serde_json::from_slice(&raw)?);
        }
        Ok(records)
    }

    /// Pages through every key under `{root}/{kind}/`.
    fn load_range_by_prefix(&self, kind: &str) -> PlacementResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = format!("{}/{}/", self.root, kind).into_bytes();
        let end = prefix_end(&prefix);
        let mut next = prefix;
        let mut out = Vec::new();
        loop {
            let page = self.kv.scan_range(&next, &end, self.page_size)?;
            let full = page.len() == self.page_size;
            if let Some((last, _)) = page.last() {
                next = last.clone();
                next.push(0);
            }
            out.extend(page);
            if !full {
                return Ok(out);
            }
        }
    }

    /// Starts a write batch.
    pub fn batch(&self) -> RuleBatch<'_> {
        RuleBatch {
            storage: self,
            ops: Vec::new(),
        }
    }

    /// Applies a batch atomically.
    pub fn commit(&self, batch: RuleBatch<'_>) -> PlacementResult<()> {
        if batch.ops.is_empty() {
            return Ok(());
        }
        tracing::debug!("Committing {} placement records", batch.ops.len());
        self.kv.write_batch(batch.ops)
    }
}

/// Pending record writes, committed together by [`RuleStorage::commit`].
pub struct RuleBatch<'a> {
    storage: &'a RuleStorage,
    ops: Vec<BatchOp>,
}

impl RuleBatch<'_> {
    fn put<T: Serialize>(&mut self, key: Vec<u8>, record: &T) -> PlacementResult<()> {
        let value = serde_json::to_vec(record)?;
        self.ops.push(BatchOp::Put { key, value });
        Ok(())
    }

    /// Stages a rule write.
    pub fn save_rule(&mut self, rule: &Rule) -> PlacementResult<()> {
        let key = self.storage.rule_path(&rule.group_id, &rule.id);
        self.put(key, rule)
    }

    /// Stages a rule removal.
    pub fn delete_rule(&mut self, group_id: &str, id: &str) {
        let key = self.storage.rule_path(group_id, id);
        self.ops.push(BatchOp::Delete { key });
    }

    /// Stages a rule group write.
    pub fn save_rule_group(&mut self, group: &RuleGroup) -> PlacementResult<()> {
        let key = self.storage.path(RULE_GROUP_PATH, &group.id);
        self.put(key, group)
    }

    /// Stages a rule group removal.
    pub fn delete_rule_group(&mut self, group_id: &str) {
        let key = self.storage.path(RULE_GROUP_PATH, group_id);
        self.ops.push(BatchOp::Delete { key });
    }

    /// Stages a label rule write.
    pub fn save_label_rule(&mut self, rule: &LabelRule) -> PlacementResult<()> {
        let key = self.storage.path(REGION_LABEL_PATH, &rule.id);
        self.put(key, rule)
    }

    /// Stages a label rule removal.
    pub fn delete_label_rule(&mut self, id: &str) {
        let key = self.storage.path(REGION_LABEL_PATH, id);
        self.ops.push(BatchOp::Delete { key });
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;
    use crate::types::Role;

    fn storage_with(page_size: usize) -> (Arc<MemoryKvStore>, RuleStorage) {
        let kv = Arc::new(MemoryKvStore::new());
        let config = PlacementConfig {
            key_root: "/pd/1/".into(),
            load_page_size: page_size,
            ..PlacementConfig::default()
        };
        let storage = RuleStorage::new(kv.clone(), &config);
        (kv, storage)
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"abc"), b"abd".to_vec());
        assert_eq!(prefix_end(b"ab\xff"), b"ac".to_vec());
        assert!(prefix_end(b"\xff\xff").is_empty());
    }

    #[test]
    fn test_rule_paths() {
        let (kv, storage) = storage_with(10);
        let mut batch = storage.batch();
        batch
            .save_rule(&Rule::new("pd", "default", Role::Voter, 3))
            .unwrap();
        batch.save_rule_group(&RuleGroup::new("pd", 0, false)).unwrap();
        storage.commit(batch).unwrap();

        assert!(kv.get(b"/pd/1/rules/7064-64656661756c74").unwrap().is_some());
        assert!(kv.get(b"/pd/1/rule_group/pd").unwrap().is_some());
        let loaded = storage.load_rules().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].count, 3);
    }

    #[test]
    fn test_dashed_ids_keep_distinct_keys() {
        let (kv, storage) = storage_with(10);
        let mut batch = storage.batch();
        batch.save_rule(&Rule::new("a-b", "c", Role::Voter, 1)).unwrap();
        batch.save_rule(&Rule::new("a", "b-c", Role::Voter, 2)).unwrap();
        storage.commit(batch).unwrap();
        assert_eq!(kv.len(), 2);

        let mut batch = storage.batch();
        batch.delete_rule("a", "b-c");
        storage.commit(batch).unwrap();
        let rules = storage.load_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!((rules[0].group_id.as_str(), rules[0].id.as_str()), ("a-b", "c"));
    }

    #[test]
    fn test_load_pages_through_prefix() {
        let (kv, storage) = storage_with(2);
        let mut batch = storage.batch();
        for i in 0..5 {
            batch
                .save_rule(&Rule::new("g", format!("r{}", i), Role::Voter, 1))
                .unwrap();
        }
        storage.commit(batch).unwrap();
        kv.put(b"/pd/1/rulesx".to_vec(), b"not json".to_vec()).unwrap();
        kv.put(b"/pd/1/rule_group/g".to_vec(), br#"{"id":"g","index":3}"#.to_vec())
            .unwrap();

        let rules = storage.load_rules().unwrap();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules[4].id, "r4");

        let groups = storage.load_rule_groups().unwrap();
        assert_eq!(groups, vec![RuleGroup::new("g", 3, false)]);
    }

    #[test]
    fn test_delete_staged_in_batch() {
        let (kv, storage) = storage_with(10);
        let mut batch = storage.batch();
        batch
            .save_rule(&Rule::new("g", "r", Role::Voter, 1))
            .unwrap();
        storage.commit(batch).unwrap();

        let mut batch = storage.batch();
        batch.delete_rule("g", "r");
        assert_eq!(batch.len(), 1);
        storage.commit(batch).unwrap();
        assert!(kv.is_empty());
    }
}
