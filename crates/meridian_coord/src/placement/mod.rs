//! Placement-rule engine.

mod fit;
mod rule;

pub use fit::{
    fit_diffs, fit_resource, isolation_score, leader_allowed_by_rules, FitDiff, ResourceFit,
    RuleFit,
};
pub use rule::{
    ConstraintOp, LabelConstraint, Rule, RuleRole, DEFAULT_RULE_GROUP, DEFAULT_RULE_ID,
};

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::bail;

use crate::meta::ResourceMeta;

/// Copy-on-write rule set. Readers grab the current tree; writers swap a
/// fresh one, so a fit computation never sees a half-applied change.
pub struct RuleManager {
    rules: RwLock<Arc<BTreeMap<(String, String), Rule>>>,
}

impl RuleManager {
    /// Start with the built-in default rule.
    pub fn new(max_replicas: usize) -> Self {
        let default = Rule::default_rule(max_replicas);
        let mut tree = BTreeMap::new();
        tree.insert(default.key(), default);
        Self {
            rules: RwLock::new(Arc::new(tree)),
        }
    }

    /// Replace the in-memory set, used when the leader loads from storage.
    pub fn load(&self, rules: Vec<Rule>) {
        let mut tree = BTreeMap::new();
        for rule in rules {
            tree.insert(rule.key(), rule);
        }
        *self.rules.write().unwrap() = Arc::new(tree);
    }

    pub fn set_rule(&self, rule: Rule) -> anyhow::Result<()> {
        if rule.group_id.is_empty() || rule.id.is_empty() {
            bail!("placement rule requires group_id and id");
        }
        if rule.count == 0 {
            bail!("placement rule count must be positive");
        }
        let mut guard = self.rules.write().unwrap();
        let mut tree = (**guard).clone();
        tree.insert(rule.key(), rule);
        *guard = Arc::new(tree);
        Ok(())
    }

    pub fn delete_rule(&self, group_id: &str, id: &str) {
        let mut guard = self.rules.write().unwrap();
        if guard.contains_key(&(group_id.to_string(), id.to_string())) {
            let mut tree = (**guard).clone();
            tree.remove(&(group_id.to_string(), id.to_string()));
            *guard = Arc::new(tree);
        }
    }

    pub fn all_rules(&self) -> Vec<Rule> {
        let tree = self.rules.read().unwrap().clone();
        let mut out: Vec<Rule> = tree.values().cloned().collect();
        out.sort_by_key(Rule::order_key);
        out
    }

    /// Rules applying to a resource, in evaluation order.
    pub fn rules_for(&self, res: &ResourceMeta) -> Vec<Rule> {
        let tree = self.rules.read().unwrap().clone();
        let mut out: Vec<Rule> = tree
            .values()
            .filter(|r| r.applies_to(res))
            .cloned()
            .collect();
        out.sort_by_key(Rule::order_key);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Epoch, ResourceState};

    fn resource(groups: &[&str]) -> ResourceMeta {
        ResourceMeta {
            id: 1,
            group: 0,
            start_key: vec![],
            end_key: vec![],
            epoch: Epoch::default(),
            peers: vec![],
            labels: BTreeMap::new(),
            state: ResourceState::Running,
            rule_groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn default_rule_applies_until_opt_in() {
        let mgr = RuleManager::new(3);
        let mut custom = Rule::default_rule(3);
        custom.group_id = "group01".into();
        custom.id = "rule01".into();
        mgr.set_rule(custom).unwrap();

        // No opt-in: both rules apply.
        assert_eq!(mgr.rules_for(&resource(&[])).len(), 2);
        // Opt-in narrows to the named group.
        let applied = mgr.rules_for(&resource(&["group01"]));
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].group_id, "group01");
    }

    #[test]
    fn set_rule_replaces_same_key() {
        let mgr = RuleManager::new(3);
        let mut replacement = Rule::default_rule(5);
        replacement.index = 1;
        mgr.set_rule(replacement).unwrap();
        let rules = mgr.all_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].count, 5);
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let mgr = RuleManager::new(3);
        let mut bad = Rule::default_rule(3);
        bad.count = 0;
        assert!(mgr.set_rule(bad).is_err());
        let mut anon = Rule::default_rule(3);
        anon.id = String::new();
        assert!(mgr.set_rule(anon).is_err());
    }
}
