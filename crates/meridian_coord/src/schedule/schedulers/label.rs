//! Enforce the `reject-leader` label property.

use rand::seq::IteratorRandom;

use crate::config::REJECT_LEADER;
use crate::schedule::filter;
use crate::schedule::{builder, ClusterView, OpKind, Operator, Scheduler};

pub struct LabelScheduler;

impl LabelScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LabelScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for LabelScheduler {
    fn name(&self) -> &str {
        "label"
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::LEADER) < opts.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();

        let offenders: Vec<_> = cluster
            .get_containers()
            .into_iter()
            .filter(|c| opts.property_matches(REJECT_LEADER, &c.meta.labels))
            .collect();

        for offender in offenders {
            let Some(res) = cluster.rand_leader_resource(offender.id(), |_| true) else {
                continue;
            };
            // A pending peer cannot take leadership yet; skip its container.
            let mut rng = rand::thread_rng();
            let target = res
                .follower_peers()
                .iter()
                .filter(|p| !res.peer_is_pending(p.id) && !res.peer_is_down(p.id))
                .filter_map(|p| cluster.get_container(p.container_id))
                .filter(|c| filter::can_receive_leader(c, &opts))
                .choose(&mut rng);
            let Some(target) = target else {
                continue;
            };
            match builder::transfer_leader(self.name(), &res, target.id(), OpKind::NONE) {
                Ok(op) => return vec![op],
                Err(err) => {
                    tracing::debug!(error = %err, "label candidate dropped");
                }
            }
        }
        Vec::new()
    }
}
