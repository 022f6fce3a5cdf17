//! Move leadership from crowded containers toward quiet ones.

use std::sync::Arc;

use crate::cluster::CachedContainer;
use crate::placement::leader_allowed_by_rules;
use crate::schedule::filter;
use crate::schedule::{builder, ClusterView, OpKind, Operator, Scheduler};

pub struct BalanceLeaderScheduler;

impl BalanceLeaderScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BalanceLeaderScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> &str {
        "balance-leader"
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::LEADER) < opts.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();

        for group in view.groups() {
            let containers: Vec<Arc<CachedContainer>> = cluster
                .get_containers()
                .into_iter()
                .filter(|c| filter::container_online(c))
                .collect();
            if containers.len() < 2 {
                continue;
            }

            let Some(source) = containers
                .iter()
                .filter(|c| filter::can_yield_leader(c))
                .max_by(|a, b| {
                    a.leader_score(group)
                        .total_cmp(&b.leader_score(group))
                        .then(b.id().cmp(&a.id()))
                })
            else {
                continue;
            };

            let mut targets: Vec<&Arc<CachedContainer>> = containers
                .iter()
                .filter(|c| c.id() != source.id() && filter::can_receive_leader(c, &opts))
                .collect();
            targets.sort_by(|a, b| {
                a.leader_score(group)
                    .total_cmp(&b.leader_score(group))
                    .then(a.id().cmp(&b.id()))
            });

            for target in targets {
                // Require real skew before churning leadership.
                if source.leader_score(group) <= target.leader_score(group) + 1.0 {
                    break;
                }
                let candidates = cluster.leader_resources(source.id());
                for res in candidates {
                    if res.meta.group != group || !filter::resource_movable(&res) {
                        continue;
                    }
                    let on_target = res
                        .follower_peers()
                        .iter()
                        .any(|p| p.container_id == target.id());
                    if !on_target {
                        continue;
                    }
                    let rules = view.rules.rules_for(&res.meta);
                    if !leader_allowed_by_rules(&rules, &target.meta.labels) {
                        continue;
                    }
                    match builder::transfer_leader(self.name(), &res, target.id(), OpKind::NONE) {
                        Ok(op) => return vec![op],
                        Err(err) => {
                            tracing::debug!(error = %err, "balance-leader candidate dropped");
                        }
                    }
                }
            }
        }
        Vec::new()
    }
}
