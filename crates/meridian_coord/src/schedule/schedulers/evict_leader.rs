//! Drain leadership from explicitly configured containers.

use std::collections::BTreeSet;

use anyhow::Context;
use rand::seq::IteratorRandom;

use crate::meta::ContainerId;
use crate::schedule::filter;
use crate::schedule::{builder, ClusterView, OpKind, OpPriority, Operator, Scheduler};

/// Operators produced per invocation.
const EVICT_LEADER_BATCH_SIZE: usize = 3;

pub struct EvictLeaderScheduler {
    container_ids: BTreeSet<ContainerId>,
}

impl EvictLeaderScheduler {
    pub fn new(container_ids: impl IntoIterator<Item = ContainerId>) -> Self {
        Self {
            container_ids: container_ids.into_iter().collect(),
        }
    }

    /// Args are container ids, one per argument.
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        if args.is_empty() {
            anyhow::bail!("evict-leader requires at least one container id");
        }
        let mut ids = BTreeSet::new();
        for arg in args {
            let id: ContainerId = arg
                .parse()
                .with_context(|| format!("invalid container id {arg:?}"))?;
            ids.insert(id);
        }
        Ok(Self { container_ids: ids })
    }

    fn schedule_once(&self, view: &ClusterView) -> Vec<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();
        let mut ops = Vec::new();
        for &container_id in &self.container_ids {
            let Some(res) =
                cluster.rand_leader_resource(container_id, filter::resource_movable)
            else {
                continue;
            };
            let mut rng = rand::thread_rng();
            let target = cluster
                .get_follower_containers(&res)
                .into_iter()
                .filter(|c| filter::can_receive_leader(c, &opts))
                .choose(&mut rng);
            let Some(target) = target else {
                continue;
            };
            match builder::transfer_leader(self.name(), &res, target.id(), OpKind::NONE) {
                Ok(op) => ops.push(op.with_priority(OpPriority::High)),
                Err(err) => {
                    tracing::debug!(error = %err, "evict-leader candidate dropped");
                }
            }
        }
        ops
    }
}

impl Scheduler for EvictLeaderScheduler {
    fn name(&self) -> &str {
        "evict-leader"
    }

    fn prepare(&self, view: &ClusterView) -> anyhow::Result<()> {
        let mut cluster = view.cluster.write().unwrap();
        let mut result = Ok(());
        for &id in &self.container_ids {
            if let Err(err) = cluster.pause_leader_transfer(id) {
                result = Err(err);
            }
        }
        result
    }

    fn cleanup(&self, view: &ClusterView) {
        let mut cluster = view.cluster.write().unwrap();
        for &id in &self.container_ids {
            cluster.resume_leader_transfer(id);
        }
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::LEADER) < opts.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let mut ops: Vec<Operator> = Vec::new();
        for _ in 0..EVICT_LEADER_BATCH_SIZE {
            let once = self.schedule_once(view);
            if once.is_empty() {
                break;
            }
            // Deduplicate by resource; one operator per resource stands.
            for op in once {
                if !ops.iter().any(|o| o.resource_id == op.resource_id) {
                    ops.push(op);
                }
            }
            if ops.len() > EVICT_LEADER_BATCH_SIZE {
                break;
            }
        }
        ops
    }
}
