//! Bulk rule transactions and the mutation entry point.
//!
//! [`BundleController`] fronts both managers: every committed change is
//! turned into the key ranges whose effective placement or labels moved, and
//! the regions overlapping those ranges are marked suspect.

use std::collections::HashSet;
use std::sync::Arc;

use crate::labeler::{LabelRule, LabelRulePatch, RegionLabeler};
use crate::placement::fit::RuleFit;
use crate::placement::manager::{Coverage, RuleConfig, RuleManager};
use crate::placement::rule::{GroupBundle, Rule, RuleGroup, RuleOp, RuleOpAction};
use crate::region::{Region, RegionDirectory, StoreLabelInventory};
use crate::suspect::SuspectRegions;
use crate::types::{KeyRange, PlacementError, PlacementResult};

/// Validates bundles before they are committed.
///
/// Rules with an empty group id inherit the bundle's id; a rule naming another
/// group, a duplicate group or a duplicate rule id within a bundle is rejected.
pub(crate) fn validate_bundles(mut bundles: Vec<GroupBundle>) -> PlacementResult<Vec<GroupBundle>> {
    let mut groups = HashSet::new();
    for bundle in &mut bundles {
        bundle.group().validate()?;
        if !groups.insert(bundle.id.clone()) {
            return Err(PlacementError::Validation(format!(
                "rule group '{}' appears in more than one bundle",
                bundle.id
            )));
        }
        let mut ids = HashSet::new();
        for rule in &mut bundle.rules {
            if rule.group_id.is_empty() {
                rule.group_id = bundle.id.clone();
            }
            if rule.group_id != bundle.id {
                return Err(PlacementError::Validation(format!(
                    "rule {} does not belong to bundle '{}'",
                    rule.key(),
                    bundle.id
                )));
            }
            rule.validate()?;
            if !ids.insert(rule.id.clone()) {
                return Err(PlacementError::Validation(format!(
                    "rule {} appears twice in its bundle",
                    rule.key()
                )));
            }
        }
    }
    Ok(bundles)
}

/// Replaces each bundle's group, or with `full_replace` everything.
pub(crate) fn apply_bundles(config: &mut RuleConfig, bundles: Vec<GroupBundle>, full_replace: bool) {
    if full_replace {
        config.clear();
    }
    for bundle in bundles {
        config.remove_group(&bundle.id);
        config.groups.insert(bundle.id.clone(), bundle.group());
        for rule in bundle.rules {
            config.upsert_rule(rule);
        }
    }
}

/// Applies rule edits in order. Deletes of missing rules are skipped; the
/// first invalid add aborts the whole batch.
pub(crate) fn apply_rule_ops(config: &mut RuleConfig, ops: Vec<RuleOp>) -> PlacementResult<()> {
    for op in ops {
        match op.action {
            RuleOpAction::Add => {
                op.rule.validate()?;
                config.upsert_rule(op.rule);
            }
            RuleOpAction::Del if op.delete_by_id_prefix => {
                let (group, prefix) = (&op.rule.group_id, &op.rule.id);
                config
                    .rules
                    .retain(|k, _| !(k.group_id == *group && k.id.starts_with(prefix.as_str())));
            }
            RuleOpAction::Del => {
                config.rules.remove(&op.rule.key());
            }
        }
    }
    Ok(())
}

/// Single entry point for placement and label mutations.
pub struct BundleController {
    rules: Arc<RuleManager>,
    labels: Arc<RegionLabeler>,
    regions: Arc<dyn RegionDirectory>,
    suspects: Arc<SuspectRegions>,
}

impl BundleController {
    /// Creates a controller over loaded managers.
    pub fn new(
        rules: Arc<RuleManager>,
        labels: Arc<RegionLabeler>,
        regions: Arc<dyn RegionDirectory>,
        suspects: Arc<SuspectRegions>,
    ) -> Self {
        Self {
            rules,
            labels,
            regions,
            suspects,
        }
    }

    /// Marks every region overlapping `ranges` as suspect. Returns how many
    /// regions were newly marked.
    pub fn mark_suspect(&self, ranges: &[KeyRange]) -> usize {
        let ids = ranges
            .iter()
            .flat_map(|r| self.regions.regions_in_range(r))
            .collect::<Vec<_>>();
        let added = self.suspects.add(ids);
        if added > 0 {
            tracing::debug!("{} regions marked suspect over {} ranges", added, ranges.len());
        }
        added
    }

    /// Asks the scheduler to check every region in `range` ahead of its scan.
    pub fn accelerate_schedule(&self, range: &KeyRange) -> usize {
        tracing::debug!("Accelerating schedule for {}", range);
        self.mark_suspect(std::slice::from_ref(range))
    }

    /// [`BundleController::accelerate_schedule`] over several ranges.
    pub fn accelerate_schedule_in_batch(&self, ranges: Vec<KeyRange>) -> usize {
        let ranges = KeyRange::coalesce(ranges);
        tracing::debug!("Accelerating schedule for {} ranges", ranges.len());
        self.mark_suspect(&ranges)
    }

    fn commit(&self, changed: PlacementResult<Vec<KeyRange>>) -> PlacementResult<()> {
        let changed = changed?;
        self.mark_suspect(&changed);
        Ok(())
    }

    /// Inserts or replaces a rule.
    pub fn set_rule(&self, rule: Rule) -> PlacementResult<()> {
        self.commit(self.rules.set_rule(rule))
    }

    /// Removes a rule.
    pub fn delete_rule(&self, group_id: &str, id: &str) -> PlacementResult<()> {
        self.commit(self.rules.delete_rule(group_id, id))
    }

    /// Inserts or replaces a rule group record.
    pub fn set_rule_group(&self, group: RuleGroup) -> PlacementResult<()> {
        self.commit(self.rules.set_rule_group(group))
    }

    /// Removes a rule group record.
    pub fn delete_rule_group(&self, group_id: &str) -> PlacementResult<()> {
        self.commit(self.rules.delete_rule_group(group_id))
    }

    /// Replaces the given groups, or with `full_replace` every group.
    pub fn set_bundles(
        &self,
        bundles: Vec<GroupBundle>,
        full_replace: bool,
        coverage: Coverage,
    ) -> PlacementResult<()> {
        self.commit(self.rules.set_bundles(bundles, full_replace, coverage))
    }

    /// Replaces one group.
    pub fn set_group_bundle(&self, bundle: GroupBundle, coverage: Coverage) -> PlacementResult<()> {
        self.commit(self.rules.set_group_bundle(bundle, coverage))
    }

    /// Removes one group, or every group matching a pattern.
    pub fn delete_group_bundle(&self, id: &str, regex: bool, coverage: Coverage) -> PlacementResult<()> {
        self.commit(self.rules.delete_group_bundle(id, regex, coverage))
    }

    /// Applies a batch of rule edits atomically.
    pub fn apply_rule_ops(&self, ops: Vec<RuleOp>, coverage: Coverage) -> PlacementResult<()> {
        self.commit(self.rules.apply_rule_ops(ops, coverage))
    }

    /// Inserts or replaces a label rule.
    pub fn set_label_rule(&self, rule: LabelRule) -> PlacementResult<()> {
        self.commit(self.labels.set_label_rule(rule))
    }

    /// Removes a label rule.
    pub fn delete_label_rule(&self, id: &str) -> PlacementResult<()> {
        self.commit(self.labels.delete_label_rule(id))
    }

    /// Applies a label patch atomically.
    pub fn patch_labels(&self, patch: LabelRulePatch) -> PlacementResult<()> {
        self.commit(self.labels.patch(patch))
    }

    /// Fits a region from a heartbeat and marks it suspect when it is out of
    /// compliance or spans more than one rule segment.
    pub fn check_region(&self, region: &Region, stores: &dyn StoreLabelInventory) -> RuleFit {
        let fit = self.rules.fit_region(region, stores);
        if !fit.is_compliant() || fit.cross_range {
            self.suspects.add([region.id]);
        }
        fit
    }
}
