//! Placement rules: records, the rule manager and region fitting.

pub mod fit;
pub mod manager;
pub mod rule;

pub use fit::{RuleFit, UnsatisfiedRule};
pub use manager::{Coverage, RuleManager, RuleSegment};
pub use rule::{
    GroupBundle, LabelConstraint, LabelConstraintOp, Rule, RuleGroup, RuleKey, RuleOp,
    RuleOpAction, DEFAULT_GROUP_ID, DEFAULT_RULE_ID,
};
