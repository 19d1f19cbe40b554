//! Desired rule sets and the diffs that install them.

use std::collections::{BTreeMap, BTreeSet};

use ds_core::{Capabilities, Origin, Rule, RuleUpdate};

use crate::builder::{
    block_rules, exemption_rules, global_block_ids, site_block_ids, Capability, RuleScope, ScopeSettings,
};
use crate::snapshot::SettingsSnapshot;

/// Groups in reconciliation order.
pub const GROUPS: [Capabilities; 5] = [
    Capabilities::EXEMPTIONS,
    Capabilities::COMPRESSION,
    Capabilities::BYPASS_CSP,
    Capabilities::SAVE_DATA,
    Capabilities::BLOCK,
];

/// Everything one group should have installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPlan {
    pub global: Vec<Rule>,
    pub sites: Vec<(Origin, Vec<Rule>)>,
}

impl GroupPlan {
    pub fn rule_ids(&self) -> BTreeSet<u32> {
        self.global
            .iter()
            .chain(self.sites.iter().flat_map(|(_, rules)| rules))
            .map(|r| r.id)
            .collect()
    }
}

/// Global rules of one group.
fn global_rules(group: Capabilities, global: &ScopeSettings, scope: &RuleScope) -> Vec<Rule> {
    if group == Capabilities::EXEMPTIONS {
        exemption_rules(&global.compression, &global.proxy)
    } else if group == Capabilities::BLOCK {
        if !global.general.enabled {
            return Vec::new();
        }
        let ids: Vec<u32> = global_block_ids().collect();
        block_rules(&ids, scope, &global.block)
    } else {
        Capability::in_group(group)
            .filter_map(|c| c.build(c.global_id(), scope, global))
            .collect()
    }
}

/// Every global rule for `global`, with `excluded` hosts left out of them.
pub fn default_rules(global: &ScopeSettings, excluded: Vec<String>) -> Vec<Rule> {
    let scope = RuleScope::Global { excluded };
    GROUPS
        .iter()
        .flat_map(|&group| global_rules(group, global, &scope))
        .collect()
}

/// Build the desired rules of `group`. `group` must be a single flag.
pub fn plan_group(group: Capabilities, snapshot: &SettingsSnapshot) -> GroupPlan {
    let scope = RuleScope::Global {
        excluded: snapshot.excluded_hosts(),
    };
    let mut plan = GroupPlan {
        global: global_rules(group, &snapshot.global, &scope),
        sites: Vec::new(),
    };
    if group == Capabilities::EXEMPTIONS {
        return plan;
    }

    let (winners, conflicts) = snapshot.resolve_offsets();
    for site in conflicts {
        log::warn!(
            "{} shares rule offset {:?} with another site; skipping its site rules",
            site.origin,
            site.offset()
        );
    }

    for (site, offset) in winners {
        let scope = RuleScope::Site {
            host: site.origin.host().to_string(),
        };
        let rules: Vec<Rule> = if group == Capabilities::BLOCK {
            if !site.settings.general.enabled {
                continue;
            }
            block_rules(&site_block_ids(&site.origin), &scope, &site.settings.block)
        } else {
            Capability::in_group(group)
                .filter_map(|c| c.build(c.site_id(offset), &scope, &site.settings))
                .collect()
        };
        if !rules.is_empty() {
            plan.sites.push((site.origin.clone(), rules));
        }
    }
    plan
}

/// Engine calls that move `live` to `plan`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    /// Removal of live rules the plan no longer contains.
    pub stale: RuleUpdate,
    /// Changed global rules, as one call.
    pub global: RuleUpdate,
    /// Changed rules of each site, one call per site.
    pub sites: Vec<RuleUpdate>,
}

impl RuleDiff {
    /// Compare a plan against the installed rules of its group. Rules that are
    /// already installed unchanged are left alone. When `focus` is set, only
    /// those IDs are considered.
    pub fn between(plan: &GroupPlan, live: &BTreeMap<u32, Rule>, focus: Option<&BTreeSet<u32>>) -> Self {
        let in_focus = |id: u32| focus.map_or(true, |f| f.contains(&id));
        let wanted = plan.rule_ids();

        let stale = RuleUpdate::remove(
            live.keys()
                .copied()
                .filter(|id| in_focus(*id) && !wanted.contains(id)),
        );

        let changed = |rules: &[Rule]| {
            let mut update = RuleUpdate::default();
            for rule in rules {
                if in_focus(rule.id) && live.get(&rule.id) != Some(rule) {
                    update.merge(RuleUpdate::replace(rule.clone()));
                }
            }
            update
        };

        Self {
            stale,
            global: changed(&plan.global),
            sites: plan
                .sites
                .iter()
                .map(|(_, rules)| changed(rules))
                .filter(|u| !u.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.global.is_empty() && self.sites.is_empty()
    }
}
