//! Fitting a resource's peers to its placement rules.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::cluster::{CachedContainer, CachedResource};
use crate::meta::{ContainerId, Peer, PeerId, PeerRole};

use super::rule::{Rule, RuleRole};

/// Peers chosen for one rule. Placeholder peers (id 0) mark containers that
/// still need a replica.
#[derive(Debug, Clone)]
pub struct RuleFit {
    pub rule: Rule,
    pub peers: Vec<Peer>,
    pub isolation_score: f64,
}

impl RuleFit {
    pub fn satisfied(&self) -> bool {
        self.peers.len() >= self.rule.count
            && self.peers.iter().all(|p| p.id != 0)
    }
}

/// The whole fit: per-rule assignments plus peers no rule wants.
#[derive(Debug, Clone, Default)]
pub struct ResourceFit {
    pub rule_fits: Vec<RuleFit>,
    pub orphan_peers: Vec<Peer>,
}

impl ResourceFit {
    pub fn satisfied(&self) -> bool {
        self.orphan_peers.is_empty() && self.rule_fits.iter().all(RuleFit::satisfied)
    }
}

/// Corrective action needed to reach the fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitDiff {
    AddLearner { container_id: ContainerId },
    Promote { peer_id: PeerId },
    Demote { peer_id: PeerId },
    Remove { peer_id: PeerId },
    TransferLeader { to_container: ContainerId },
}

/// Isolation score of a container set over the location labels: more
/// distinct values at more significant levels score higher.
pub fn isolation_score(
    containers: &[&Arc<CachedContainer>],
    location_labels: &[String],
) -> f64 {
    let mut score = 0.0;
    for (level, label) in location_labels.iter().enumerate() {
        let distinct: HashSet<&str> = containers
            .iter()
            .map(|c| c.meta.label(label).unwrap_or("unknown"))
            .collect();
        let weight = 10f64.powi((location_labels.len() - 1 - level) as i32);
        score += distinct.len() as f64 * weight;
    }
    score
}

/// Compute the fit of `res` against `rules` (already filtered to applying
/// rules, evaluation order).
///
/// Existing peers are assigned to rules first to minimize churn; shortages
/// are filled greedily from the remaining candidates, preferring isolation
/// gain, then resource count, then container id.
pub fn fit_resource(
    containers: &[Arc<CachedContainer>],
    res: &CachedResource,
    rules: &[Rule],
) -> ResourceFit {
    let by_id: BTreeMap<ContainerId, &Arc<CachedContainer>> =
        containers.iter().map(|c| (c.id(), c)).collect();

    let mut unassigned: Vec<Peer> = res.meta.peers.clone();
    unassigned.sort_by_key(|p| p.id);
    let mut used_containers: HashSet<ContainerId> =
        res.meta.peers.iter().map(|p| p.container_id).collect();
    let mut fits = Vec::with_capacity(rules.len());

    for rule in rules {
        let candidates: Vec<&Arc<CachedContainer>> = containers
            .iter()
            .filter(|c| c.is_up() && rule.matches_labels(&c.meta.labels))
            .collect();
        let candidate_ids: HashSet<ContainerId> = candidates.iter().map(|c| c.id()).collect();

        // Keep peers that already sit on an acceptable container.
        let mut chosen: Vec<Peer> = Vec::with_capacity(rule.count);
        let role_matches = |p: &Peer| match rule.role {
            RuleRole::Learner => p.role == PeerRole::Learner,
            _ => p.role != PeerRole::Learner,
        };
        for preferred in [true, false] {
            let mut i = 0;
            while i < unassigned.len() && chosen.len() < rule.count {
                let peer = unassigned[i];
                if candidate_ids.contains(&peer.container_id) && role_matches(&peer) == preferred {
                    chosen.push(peer);
                    unassigned.remove(i);
                } else {
                    i += 1;
                }
            }
        }

        // Fill the shortage from candidates without any peer yet.
        while chosen.len() < rule.count {
            let chosen_refs: Vec<&Arc<CachedContainer>> = chosen
                .iter()
                .filter_map(|p| by_id.get(&p.container_id).copied())
                .collect();
            let pick = candidates
                .iter()
                .filter(|c| !used_containers.contains(&c.id()))
                .max_by(|a, b| {
                    let mut with_a = chosen_refs.clone();
                    with_a.push(**a);
                    let mut with_b = chosen_refs.clone();
                    with_b.push(**b);
                    let score_a = isolation_score(&with_a, &rule.location_labels);
                    let score_b = isolation_score(&with_b, &rule.location_labels);
                    score_a
                        .total_cmp(&score_b)
                        .then(b.resource_count(res.meta.group).cmp(&a.resource_count(res.meta.group)))
                        .then(b.id().cmp(&a.id()))
                })
                .copied();
            let Some(container) = pick else {
                break;
            };
            used_containers.insert(container.id());
            chosen.push(Peer {
                id: 0,
                container_id: container.id(),
                role: match rule.role {
                    RuleRole::Learner => PeerRole::Learner,
                    _ => PeerRole::Voter,
                },
            });
        }

        let chosen_refs: Vec<&Arc<CachedContainer>> = chosen
            .iter()
            .filter_map(|p| by_id.get(&p.container_id).copied())
            .collect();
        fits.push(RuleFit {
            isolation_score: isolation_score(&chosen_refs, &rule.location_labels),
            rule: rule.clone(),
            peers: chosen,
        });
    }

    ResourceFit {
        rule_fits: fits,
        orphan_peers: unassigned,
    }
}

/// Actions that move `res` toward `fit`.
pub fn fit_diffs(res: &CachedResource, fit: &ResourceFit) -> Vec<FitDiff> {
    let mut diffs = Vec::new();
    for rule_fit in &fit.rule_fits {
        for peer in &rule_fit.peers {
            if peer.id == 0 {
                diffs.push(FitDiff::AddLearner {
                    container_id: peer.container_id,
                });
                continue;
            }
            match (rule_fit.rule.role, peer.role) {
                (RuleRole::Learner, role) if role != PeerRole::Learner => {
                    diffs.push(FitDiff::Demote { peer_id: peer.id });
                }
                (RuleRole::Voter | RuleRole::Leader | RuleRole::Follower, PeerRole::Learner) => {
                    diffs.push(FitDiff::Promote { peer_id: peer.id });
                }
                _ => {}
            }
        }
    }
    for peer in &fit.orphan_peers {
        diffs.push(FitDiff::Remove { peer_id: peer.id });
    }

    if let Some(leader) = &res.leader {
        if !leader_placement_ok(leader, fit) {
            let target = fit
                .rule_fits
                .iter()
                .filter(|rf| rf.rule.role.leader_eligible())
                .flat_map(|rf| rf.peers.iter())
                .find(|p| p.id != 0 && p.id != leader.id && p.role != PeerRole::Learner);
            if let Some(target) = target {
                diffs.push(FitDiff::TransferLeader {
                    to_container: target.container_id,
                });
            }
        }
    }
    diffs
}

fn leader_placement_ok(leader: &Peer, fit: &ResourceFit) -> bool {
    let leader_rules: Vec<&RuleFit> = fit
        .rule_fits
        .iter()
        .filter(|rf| rf.rule.role == RuleRole::Leader)
        .collect();
    if leader_rules.is_empty() {
        // Any Voter-rule assignment keeps the leader in place.
        return fit
            .rule_fits
            .iter()
            .filter(|rf| rf.rule.role.leader_eligible())
            .any(|rf| rf.peers.iter().any(|p| p.id == leader.id));
    }
    leader_rules
        .iter()
        .any(|rf| rf.peers.iter().any(|p| p.id == leader.id))
}

/// Whether `labels` may hold leadership for a resource under `rules`
/// (already filtered to applying rules). Dedicated Leader rules confine
/// leadership to their candidates; otherwise any leader-eligible rule whose
/// constraints match will do.
pub fn leader_allowed_by_rules(
    rules: &[Rule],
    labels: &BTreeMap<String, String>,
) -> bool {
    let leader_rules: Vec<&Rule> = rules.iter().filter(|r| r.role == RuleRole::Leader).collect();
    if !leader_rules.is_empty() {
        return leader_rules.iter().any(|r| r.matches_labels(labels));
    }
    rules
        .iter()
        .any(|r| r.role.leader_eligible() && r.matches_labels(labels))
}
