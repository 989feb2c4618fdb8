//! Placement rule records: rules, rule groups, bundles and batch operations.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::region::StoreLabel;
use crate::types::{hex_key, KeyRange, PlacementError, PlacementResult, Role};

/// Group of the reserved default rule.
pub const DEFAULT_GROUP_ID: &str = "pd";
/// Identifier of the reserved default rule.
pub const DEFAULT_RULE_ID: &str = "default";

/// Unique address of a rule.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey {
    /// Owning group.
    pub group_id: String,
    /// Rule identifier within the group.
    pub id: String,
}

impl RuleKey {
    /// Creates a rule key.
    pub fn new(group_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            id: id.into(),
        }
    }

    /// The reserved default rule's key.
    pub fn default_rule() -> Self {
        Self::new(DEFAULT_GROUP_ID, DEFAULT_RULE_ID)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.id)
    }
}

/// Predicate operator over a store label.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LabelConstraintOp {
    /// The label value is one of `values`.
    In,
    /// The label is absent or its value is not in `values`.
    NotIn,
    /// The label is present.
    Exists,
    /// The label is absent.
    NotExists,
}

/// A predicate a store's labels must satisfy to host a rule's peers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelConstraint {
    /// Label key.
    pub key: String,
    /// Operator.
    pub op: LabelConstraintOp,
    /// Operand values for `in` / `notIn`.
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelConstraint {
    /// Creates a constraint.
    pub fn new(key: impl Into<String>, op: LabelConstraintOp, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            op,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Evaluates the constraint against a store's labels.
    pub fn matches(&self, labels: &[StoreLabel]) -> bool {
        let value = labels
            .iter()
            .find(|l| l.key == self.key)
            .map(|l| l.value.as_str());
        let listed = value.is_some_and(|v| self.values.iter().any(|x| x == v));
        match self.op {
            LabelConstraintOp::In => listed,
            LabelConstraintOp::NotIn => !listed,
            LabelConstraintOp::Exists => value.is_some(),
            LabelConstraintOp::NotExists => value.is_none(),
        }
    }

    fn validate(&self) -> PlacementResult<()> {
        if self.key.is_empty() {
            return Err(PlacementError::Validation(
                "label constraint key is empty".into(),
            ));
        }
        let needs_values = matches!(self.op, LabelConstraintOp::In | LabelConstraintOp::NotIn);
        if needs_values && self.values.is_empty() {
            return Err(PlacementError::Validation(format!(
                "label constraint on '{}' needs at least one value",
                self.key
            )));
        }
        Ok(())
    }
}

/// A declarative replica requirement for a key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Owning group.
    pub group_id: String,
    /// Identifier within the group.
    pub id: String,
    /// Inclusive start key.
    #[serde(default, with = "hex_key")]
    pub start_key: Vec<u8>,
    /// Exclusive end key; empty means unbounded.
    #[serde(default, with = "hex_key")]
    pub end_key: Vec<u8>,
    /// Role the selected peers must hold.
    pub role: Role,
    /// Number of peers required.
    pub count: i32,
    /// Store label predicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_constraints: Vec<LabelConstraint>,
    /// Label key whose values the peers should be spread across.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub isolation_level: String,
}

impl Rule {
    /// Creates a rule spanning the whole key space.
    pub fn new(group_id: impl Into<String>, id: impl Into<String>, role: Role, count: i32) -> Self {
        Self {
            group_id: group_id.into(),
            id: id.into(),
            start_key: Vec::new(),
            end_key: Vec::new(),
            role,
            count,
            label_constraints: Vec::new(),
            isolation_level: String::new(),
        }
    }

    /// Restricts the rule to `[start_key, end_key)`.
    pub fn with_range(mut self, start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        self.start_key = start_key.into();
        self.end_key = end_key.into();
        self
    }

    /// Adds a label constraint.
    pub fn with_constraint(mut self, constraint: LabelConstraint) -> Self {
        self.label_constraints.push(constraint);
        self
    }

    /// Sets the isolation label key.
    pub fn with_isolation_level(mut self, level: impl Into<String>) -> Self {
        self.isolation_level = level.into();
        self
    }

    /// The rule's address.
    pub fn key(&self) -> RuleKey {
        RuleKey::new(self.group_id.clone(), self.id.clone())
    }

    /// The rule's key range.
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.start_key.clone(), self.end_key.clone())
    }

    /// Checks identifiers, range, count and constraints.
    pub fn validate(&self) -> PlacementResult<()> {
        if self.group_id.is_empty() {
            return Err(PlacementError::Validation(format!(
                "rule '{}' has an empty group id",
                self.id
            )));
        }
        if self.id.is_empty() {
            return Err(PlacementError::Validation(format!(
                "rule in group '{}' has an empty id",
                self.group_id
            )));
        }
        if !self.end_key.is_empty() && self.start_key > self.end_key {
            return Err(PlacementError::Validation(format!(
                "rule {}: start key {} is after end key {}",
                self.key(),
                hex::encode(&self.start_key),
                hex::encode(&self.end_key)
            )));
        }
        if self.count < 0 {
            return Err(PlacementError::Validation(format!(
                "rule {}: count {} is negative",
                self.key(),
                self.count
            )));
        }
        for constraint in &self.label_constraints {
            constraint.validate()?;
        }
        Ok(())
    }
}

/// Priority and override behavior shared by the rules of one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroup {
    /// Group identifier.
    pub id: String,
    /// Fold position; lower indexes are folded first.
    #[serde(default)]
    pub index: i32,
    /// Whether the group's rules evict previously folded rules they intersect.
    #[serde(default, rename = "override")]
    pub is_override: bool,
}

impl RuleGroup {
    /// Creates a rule group.
    pub fn new(id: impl Into<String>, index: i32, is_override: bool) -> Self {
        Self {
            id: id.into(),
            index,
            is_override,
        }
    }

    /// Configuration used by a group that has rules but no record.
    pub fn implicit(id: impl Into<String>) -> Self {
        Self::new(id, 0, false)
    }

    pub(crate) fn validate(&self) -> PlacementResult<()> {
        if self.id.is_empty() {
            return Err(PlacementError::Validation("rule group id is empty".into()));
        }
        Ok(())
    }
}

/// A rule group together with its complete rule list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBundle {
    /// Group identifier.
    #[serde(rename = "group_id")]
    pub id: String,
    /// Group index.
    #[serde(default, rename = "group_index")]
    pub index: i32,
    /// Group override flag.
    #[serde(default, rename = "group_override")]
    pub is_override: bool,
    /// Every rule of the group.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl GroupBundle {
    /// Creates a bundle.
    pub fn new(group: RuleGroup, rules: Vec<Rule>) -> Self {
        Self {
            id: group.id,
            index: group.index,
            is_override: group.is_override,
            rules,
        }
    }

    /// The bundle's group configuration.
    pub fn group(&self) -> RuleGroup {
        RuleGroup::new(self.id.clone(), self.index, self.is_override)
    }
}

/// Action of a batched rule edit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOpAction {
    /// Insert or replace the rule.
    Add,
    /// Remove the rule; missing rules are skipped.
    Del,
}

/// One step of an incremental rule batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOp {
    /// Target rule; only `group_id` and `id` matter for deletes.
    pub rule: Rule,
    /// Edit to apply.
    pub action: RuleOpAction,
    /// For deletes, remove every rule of the group whose id starts with `rule.id`.
    #[serde(default)]
    pub delete_by_id_prefix: bool,
}

impl RuleOp {
    /// An add step.
    pub fn add(rule: Rule) -> Self {
        Self {
            rule,
            action: RuleOpAction::Add,
            delete_by_id_prefix: false,
        }
    }

    /// A delete step.
    pub fn delete(rule: Rule) -> Self {
        Self {
            rule,
            action: RuleOpAction::Del,
            delete_by_id_prefix: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<StoreLabel> {
        pairs.iter().map(|(k, v)| StoreLabel::new(*k, *v)).collect()
    }

    #[test]
    fn test_constraint_operators() {
        let store = labels(&[("zone", "z1"), ("disk", "ssd")]);

        assert!(LabelConstraint::new("zone", LabelConstraintOp::In, &["z1", "z2"]).matches(&store));
        assert!(!LabelConstraint::new("zone", LabelConstraintOp::In, &["z3"]).matches(&store));
        assert!(!LabelConstraint::new("host", LabelConstraintOp::In, &["h1"]).matches(&store));

        assert!(LabelConstraint::new("zone", LabelConstraintOp::NotIn, &["z3"]).matches(&store));
        assert!(!LabelConstraint::new("zone", LabelConstraintOp::NotIn, &["z1"]).matches(&store));
        assert!(LabelConstraint::new("host", LabelConstraintOp::NotIn, &["h1"]).matches(&store));

        assert!(LabelConstraint::new("disk", LabelConstraintOp::Exists, &[]).matches(&store));
        assert!(!LabelConstraint::new("host", LabelConstraintOp::Exists, &[]).matches(&store));
        assert!(LabelConstraint::new("host", LabelConstraintOp::NotExists, &[]).matches(&store));
        assert!(!LabelConstraint::new("disk", LabelConstraintOp::NotExists, &[]).matches(&store));
    }

    #[test]
    fn test_validate_rejects_negative_count() {
        let rule = Rule::new("g", "r", Role::Voter, -1);
        assert!(matches!(rule.validate(), Err(PlacementError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let rule = Rule::new("g", "r", Role::Voter, 1).with_range(b"b".to_vec(), b"a".to_vec());
        assert!(rule.validate().is_err());

        let open = Rule::new("g", "r", Role::Voter, 1).with_range(b"b".to_vec(), b"".to_vec());
        assert!(open.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_ids_and_bad_constraints() {
        assert!(Rule::new("", "r", Role::Voter, 1).validate().is_err());
        assert!(Rule::new("g", "", Role::Voter, 1).validate().is_err());

        let no_values = Rule::new("g", "r", Role::Voter, 1)
            .with_constraint(LabelConstraint::new("zone", LabelConstraintOp::In, &[]));
        assert!(no_values.validate().is_err());

        let no_key = Rule::new("g", "r", Role::Voter, 1)
            .with_constraint(LabelConstraint::new("", LabelConstraintOp::Exists, &[]));
        assert!(no_key.validate().is_err());
    }

    #[test]
    fn test_rule_wire_format() {
        let rule = Rule::new("pd", "default", Role::Voter, 3)
            .with_range(b"a".to_vec(), b"".to_vec())
            .with_constraint(LabelConstraint::new("zone", LabelConstraintOp::NotIn, &["z9"]))
            .with_isolation_level("zone");
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["group_id"], "pd");
        assert_eq!(json["start_key"], "61");
        assert_eq!(json["end_key"], "");
        assert_eq!(json["role"], "voter");
        assert_eq!(json["label_constraints"][0]["op"], "notIn");

        let decoded: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, rule);
    }

    #[test]
    fn test_group_and_bundle_wire_format() {
        let group = RuleGroup::new("tiflash", 120, true);
        let json = serde_json::to_string(&group).unwrap();
        assert_eq!(json, r#"{"id":"tiflash","index":120,"override":true}"#);

        let bundle = GroupBundle::new(group, vec![Rule::new("tiflash", "learner", Role::Learner, 1)]);
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["group_id"], "tiflash");
        assert_eq!(json["group_index"], 120);
        assert_eq!(json["group_override"], true);
        let decoded: GroupBundle = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn test_rule_op_decodes_action() {
        let op: RuleOp = serde_json::from_str(
            r#"{"rule":{"group_id":"pd","id":"test","role":"voter","count":3},"action":"del"}"#,
        )
        .unwrap();
        assert_eq!(op.action, RuleOpAction::Del);
        assert!(!op.delete_by_id_prefix);
        assert_eq!(op.rule.key(), RuleKey::new("pd", "test"));
    }
}
