//! Matching a region's peers against its merged rules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::placement::rule::Rule;
use crate::region::{Peer, Region, StoreLabel, StoreLabelInventory};
use crate::types::{Role, StoreId};

/// A rule that could not fill all of its slots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnsatisfiedRule {
    /// The rule.
    pub rule: Rule,
    /// Role of the missing peers.
    pub role: Role,
    /// Number of missing peers.
    pub shortfall: usize,
}

/// Outcome of comparing a region's peers with its applicable rules.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RuleFit {
    /// Rules with every slot filled.
    pub satisfied: Vec<Rule>,
    /// Rules short of peers.
    pub unsatisfied: Vec<UnsatisfiedRule>,
    /// Peers no rule consumed.
    pub orphans: Vec<Peer>,
    /// The region spans more than one merged rule segment and should be split.
    pub cross_range: bool,
}

impl RuleFit {
    /// True when every rule is satisfied and no peer is left over.
    pub fn is_compliant(&self) -> bool {
        self.unsatisfied.is_empty() && self.orphans.is_empty()
    }

    /// Total peer slots demanded by the applicable rules.
    pub fn required_peers(&self) -> usize {
        self.satisfied
            .iter()
            .chain(self.unsatisfied.iter().map(|u| &u.rule))
            .map(|r| r.count.max(0) as usize)
            .sum()
    }
}

/// Fits `region` against `rules`, given in merge order.
pub(crate) fn fit_region(
    region: &Region,
    rules: &[Arc<Rule>],
    stores: &dyn StoreLabelInventory,
    cross_range: bool,
) -> RuleFit {
    let peers = &region.peers;
    let labels: HashMap<StoreId, Vec<StoreLabel>> = peers
        .iter()
        .map(|p| (p.store_id, stores.store_labels(p.store_id)))
        .collect();
    let labels_of = |peer: &Peer| labels.get(&peer.store_id).map(Vec::as_slice).unwrap_or(&[]);

    let mut ordered: Vec<&Arc<Rule>> = rules.iter().collect();
    ordered.sort_by_key(|r| r.role.specificity());

    let mut matched = vec![false; peers.len()];
    let mut fit = RuleFit {
        cross_range,
        ..RuleFit::default()
    };

    for rule in ordered {
        let want = rule.count.max(0) as usize;
        let mut candidates: Vec<usize> = (0..peers.len())
            .filter(|&i| !matched[i] && rule.role.accepts(peers[i].role))
            .filter(|&i| {
                let store = labels_of(&peers[i]);
                rule.label_constraints.iter().all(|c| c.matches(store))
            })
            .collect();
        candidates.sort_by_key(|&i| peers[i].store_id);

        let picked: Vec<usize> = if rule.isolation_level.is_empty() {
            candidates.into_iter().take(want).collect()
        } else {
            pick_isolated(&candidates, want, |i| {
                labels_of(&peers[i])
                    .iter()
                    .find(|l| l.key == rule.isolation_level)
                    .map(|l| l.value.as_str())
            })
        };
        for &i in &picked {
            matched[i] = true;
        }

        if picked.len() < want {
            fit.unsatisfied.push(UnsatisfiedRule {
                rule: rule.as_ref().clone(),
                role: rule.role,
                shortfall: want - picked.len(),
            });
        } else {
            fit.satisfied.push(rule.as_ref().clone());
        }
    }

    let mut orphans: Vec<Peer> = peers
        .iter()
        .zip(&matched)
        .filter(|(_, m)| !**m)
        .map(|(p, _)| *p)
        .collect();
    orphans.sort_by_key(|p| p.store_id);
    fit.orphans = orphans;
    fit
}

/// Picks one candidate per distinct isolation value first, then fills the
/// remaining slots in candidate order. Stores missing the label share one value.
fn pick_isolated<'a, F>(candidates: &[usize], want: usize, value_of: F) -> Vec<usize>
where
    F: Fn(usize) -> Option<&'a str>,
{
    let mut picked = Vec::with_capacity(want);
    let mut seen = HashSet::new();
    for &i in candidates {
        if picked.len() == want {
            return picked;
        }
        if seen.insert(value_of(i)) {
            picked.push(i);
        }
    }
    for &i in candidates {
        if picked.len() == want {
            break;
        }
        if !picked.contains(&i) {
            picked.push(i);
        }
    }
    picked
}
