//! Declarative placement rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::ResourceMeta;

/// Default rule group every resource belongs to unless it opts into
/// specific groups.
pub const DEFAULT_RULE_GROUP: &str = "meridian";
pub const DEFAULT_RULE_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleRole {
    Voter,
    Leader,
    Follower,
    Learner,
}

impl RuleRole {
    /// Whether a peer placed for this rule may hold leadership.
    pub fn leader_eligible(self) -> bool {
        matches!(self, RuleRole::Voter | RuleRole::Leader)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    In,
    NotIn,
    Exists,
    NotExists,
}

/// One label constraint a candidate container must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConstraint {
    pub key: String,
    pub op: ConstraintOp,
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelConstraint {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.op {
            ConstraintOp::In => value.is_some_and(|v| self.values.iter().any(|c| c == v)),
            ConstraintOp::NotIn => !value.is_some_and(|v| self.values.iter().any(|c| c == v)),
            ConstraintOp::Exists => value.is_some(),
            ConstraintOp::NotExists => value.is_none(),
        }
    }
}

/// A placement rule: how many peers of which role live where, for the
/// resources overlapping `[start_key, end_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub group_id: String,
    pub id: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub start_key: Vec<u8>,
    #[serde(default)]
    pub end_key: Vec<u8>,
    pub role: RuleRole,
    pub count: usize,
    #[serde(default)]
    pub label_constraints: Vec<LabelConstraint>,
    #[serde(default)]
    pub location_labels: Vec<String>,
    /// Unix seconds at creation, part of the deterministic ordering.
    #[serde(default)]
    pub created_at: u64,
}

impl Rule {
    pub fn key(&self) -> (String, String) {
        (self.group_id.clone(), self.id.clone())
    }

    /// Deterministic evaluation order.
    pub fn order_key(&self) -> (u32, u64, String, String) {
        (
            self.index,
            self.created_at,
            self.group_id.clone(),
            self.id.clone(),
        )
    }

    pub fn overlaps(&self, res: &ResourceMeta) -> bool {
        let starts_before_res_end =
            res.end_key.is_empty() || self.start_key.is_empty() || self.start_key < res.end_key;
        let ends_after_res_start =
            self.end_key.is_empty() || res.start_key.is_empty() || self.end_key > res.start_key;
        starts_before_res_end && ends_after_res_start
    }

    /// A rule applies when ranges overlap and the resource either carries no
    /// rule-group opt-in or opts into this rule's group.
    pub fn applies_to(&self, res: &ResourceMeta) -> bool {
        if !self.overlaps(res) {
            return false;
        }
        res.rule_groups.is_empty() || res.rule_groups.iter().any(|g| *g == self.group_id)
    }

    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.label_constraints.iter().all(|c| c.matches(labels))
    }

    /// The built-in rule when nothing else is configured.
    pub fn default_rule(max_replicas: usize) -> Rule {
        Rule {
            group_id: DEFAULT_RULE_GROUP.to_string(),
            id: DEFAULT_RULE_ID.to_string(),
            index: 0,
            start_key: Vec::new(),
            end_key: Vec::new(),
            role: RuleRole::Voter,
            count: max_replicas,
            label_constraints: Vec::new(),
            location_labels: Vec::new(),
            created_at: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Epoch, ResourceState};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn resource(start: &[u8], end: &[u8], groups: &[&str]) -> ResourceMeta {
        ResourceMeta {
            id: 1,
            group: 0,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch: Epoch::default(),
            peers: vec![],
            labels: BTreeMap::new(),
            state: ResourceState::Running,
            rule_groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    #[test]
    fn constraint_ops() {
        let host_a = labels(&[("host", "a")]);
        let empty = BTreeMap::new();
        let in_a = LabelConstraint {
            key: "host".into(),
            op: ConstraintOp::In,
            values: vec!["a".into(), "b".into()],
        };
        assert!(in_a.matches(&host_a));
        assert!(!in_a.matches(&empty));

        let not_in = LabelConstraint {
            key: "host".into(),
            op: ConstraintOp::NotIn,
            values: vec!["a".into()],
        };
        assert!(!not_in.matches(&host_a));
        assert!(not_in.matches(&empty));

        let exists = LabelConstraint {
            key: "host".into(),
            op: ConstraintOp::Exists,
            values: vec![],
        };
        assert!(exists.matches(&host_a));
        assert!(!exists.matches(&empty));
    }

    #[test]
    fn rule_group_opt_in_narrows_applicability() {
        let mut rule = Rule::default_rule(3);
        rule.group_id = "group01".into();
        // No opt-in: every overlapping rule applies.
        assert!(rule.applies_to(&resource(b"", b"", &[])));
        // Opt-in restricts to the named groups.
        assert!(rule.applies_to(&resource(b"", b"", &["group01"])));
        assert!(!rule.applies_to(&resource(b"", b"", &["other"])));
    }

    #[test]
    fn range_overlap_is_half_open() {
        let mut rule = Rule::default_rule(3);
        rule.start_key = b"b".to_vec();
        rule.end_key = b"d".to_vec();
        assert!(rule.overlaps(&resource(b"a", b"c", &[])));
        assert!(!rule.overlaps(&resource(b"d", b"e", &[])));
        assert!(rule.overlaps(&resource(b"", b"", &[])));
    }
}
