//! Converge every resource toward its placement-rule fit.
//!
//! One corrective action per tick per resource family, in the reconcile
//! style of the background managers: compute the fit, take the first diff,
//! emit the matching operator. Repeated ticks walk a resource through
//! add -> promote -> demote -> remove until the fit holds.

use crate::meta::PeerRole;
use crate::placement::{fit_diffs, fit_resource, FitDiff};
use crate::schedule::filter;
use crate::schedule::{builder, ClusterView, OpKind, OpStep, Operator, Scheduler};

pub struct ReplicaCheckerScheduler;

impl ReplicaCheckerScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReplicaCheckerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ReplicaCheckerScheduler {
    fn name(&self) -> &str {
        "replica-checker"
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::REPLICA) < opts.replica_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let cluster = view.cluster.read().unwrap();
        let containers = cluster.get_containers();

        for res in cluster.get_resources() {
            if view.controller.get_operator(res.id()).is_some() {
                continue;
            }
            if !filter::resource_movable(&res) {
                continue;
            }
            let rules = view.rules.rules_for(&res.meta);
            let fit = fit_resource(&containers, &res, &rules);
            let Some(diff) = fit_diffs(&res, &fit).into_iter().next() else {
                continue;
            };

            let built = match diff {
                FitDiff::AddLearner { container_id } => {
                    let Ok(peer_id) = view.id_alloc.alloc() else {
                        return Vec::new();
                    };
                    Ok(Operator::new(
                        format!("{}: add learner on container {container_id}", self.name()),
                        res.id(),
                        res.meta.epoch,
                        OpKind::REPLICA,
                        vec![OpStep::AddLearner { container_id, peer_id }],
                    ))
                }
                FitDiff::Promote { peer_id } => {
                    let Some(peer) = res.peer(peer_id) else {
                        continue;
                    };
                    Ok(Operator::new(
                        format!("{}: promote peer {peer_id}", self.name()),
                        res.id(),
                        res.meta.epoch,
                        OpKind::REPLICA,
                        vec![OpStep::PromoteLearner {
                            container_id: peer.container_id,
                            peer_id,
                        }],
                    ))
                }
                FitDiff::Demote { peer_id } => {
                    let Some(peer) = res.peer(peer_id) else {
                        continue;
                    };
                    Ok(Operator::new(
                        format!("{}: demote peer {peer_id}", self.name()),
                        res.id(),
                        res.meta.epoch,
                        OpKind::REPLICA,
                        vec![OpStep::DemoteVoter {
                            container_id: peer.container_id,
                            peer_id,
                        }],
                    ))
                }
                FitDiff::Remove { peer_id } => {
                    let Some(peer) = res.peer(peer_id) else {
                        continue;
                    };
                    // Leadership steps aside before its peer is removed.
                    let mut steps = Vec::new();
                    if res.leader.as_ref().map(|l| l.id) == Some(peer_id) {
                        let target = res
                            .follower_peers()
                            .iter()
                            .find(|p| p.role != PeerRole::Learner)
                            .map(|p| p.container_id);
                        let Some(to) = target else {
                            continue;
                        };
                        steps.push(OpStep::TransferLeader { from: peer.container_id, to });
                    }
                    steps.push(OpStep::RemovePeer {
                        container_id: peer.container_id,
                        peer_id,
                    });
                    Ok(Operator::new(
                        format!("{}: remove peer {peer_id}", self.name()),
                        res.id(),
                        res.meta.epoch,
                        OpKind::REPLICA,
                        steps,
                    ))
                }
                FitDiff::TransferLeader { to_container } => {
                    builder::transfer_leader(self.name(), &res, to_container, OpKind::REPLICA)
                }
            };
            match built {
                Ok(op) => return vec![op],
                Err(err) => {
                    tracing::debug!(error = %err, "replica-checker candidate dropped");
                }
            }
        }
        Vec::new()
    }
}
