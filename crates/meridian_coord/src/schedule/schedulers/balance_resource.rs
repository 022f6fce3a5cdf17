//! Move replicas from crowded containers toward quiet ones.

use std::sync::Arc;

use crate::cluster::CachedContainer;
use crate::schedule::filter;
use crate::schedule::{builder, ClusterView, OpKind, Operator, Scheduler};

pub struct BalanceResourceScheduler;

impl BalanceResourceScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BalanceResourceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for BalanceResourceScheduler {
    fn name(&self) -> &str {
        "balance-resource"
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::RESOURCE) < opts.resource_schedule_limit
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

            let Some(source) = containers.iter().max_by(|a, b| {
                a.resource_score(group, &opts)
                    .total_cmp(&b.resource_score(group, &opts))
                    .then(b.id().cmp(&a.id()))
            }) else {
                continue;
            };

            let mut targets: Vec<&Arc<CachedContainer>> = containers
                .iter()
                .filter(|c| c.id() != source.id() && filter::balance_target_ok(c, &opts))
                .collect();
            targets.sort_by(|a, b| {
                a.resource_score(group, &opts)
                    .total_cmp(&b.resource_score(group, &opts))
                    .then(a.id().cmp(&b.id()))
            });

            for target in targets {
                if source.resource_count(group) <= target.resource_count(group) + 1 {
                    break;
                }
                let has_no_peer_on_target =
                    |res: &crate::cluster::CachedResource| -> bool {
                        res.meta.group == group
                            && filter::resource_movable(res)
                            && res.container_peer(target.id()).is_none()
                    };
                let picked = cluster
                    .rand_follower_resource(source.id(), &has_no_peer_on_target)
                    .or_else(|| cluster.rand_leader_resource(source.id(), &has_no_peer_on_target));
                let Some(res) = picked else {
                    continue;
                };
                let new_peer_id = match view.id_alloc.alloc() {
                    Ok(id) => id,
                    Err(err) => {
                        tracing::warn!(error = ?err, "peer id allocation failed");
                        return Vec::new();
                    }
                };
                match builder::move_peer(
                    self.name(),
                    &res,
                    source.id(),
                    target.id(),
                    new_peer_id,
                    OpKind::NONE,
                ) {
                    Ok(op) => return vec![op],
                    Err(err) => {
                        tracing::debug!(error = %err, "balance-resource candidate dropped");
                    }
                }
            }
        }
        Vec::new()
    }
}
