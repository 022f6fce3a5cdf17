//! Hot-spot relief: move the hottest flow away from overloaded containers.
//!
//! Read hot spots are relieved by moving leadership onto the coldest peer;
//! write hot spots move the peer itself to a cold-enough container (hot
//! dedicated containers are acceptable targets, reserved ones never).

use std::sync::{Arc, RwLock};

use crate::cluster::CachedContainer;
use crate::schedule::filter;
use crate::schedule::{builder, ClusterView, OpKind, OpPriority, Operator, Scheduler};
use crate::statistics::{ContainerLoadKind, FlowKind, HotPeerStat};

/// Tuning block for hot scheduling.
#[derive(Debug, Clone)]
pub struct HotSchedulerConfig {
    pub min_hot_byte_rate: f64,
    pub min_hot_key_rate: f64,
    pub max_zombie_rounds: u32,
    pub max_peer_count: usize,
    pub byte_rate_rank_step_ratio: f64,
    pub key_rate_rank_step_ratio: f64,
    pub count_rank_step_ratio: f64,
    pub great_dec_ratio: f64,
    pub minor_dec_ratio: f64,
    /// Tolerate this much relative skew before moving off the source.
    pub src_tolerance_ratio: f64,
    /// The destination must stay below source / this ratio after the move.
    pub dst_tolerance_ratio: f64,
}

impl Default for HotSchedulerConfig {
    fn default() -> Self {
        Self {
            min_hot_byte_rate: 100.0,
            min_hot_key_rate: 10.0,
            max_zombie_rounds: 3,
            max_peer_count: 1000,
            byte_rate_rank_step_ratio: 0.05,
            key_rate_rank_step_ratio: 0.05,
            count_rank_step_ratio: 0.01,
            great_dec_ratio: 0.95,
            minor_dec_ratio: 0.99,
            src_tolerance_ratio: 1.05,
            dst_tolerance_ratio: 1.05,
        }
    }
}

pub struct HotResourceScheduler {
    kind: FlowKind,
    config: RwLock<HotSchedulerConfig>,
}

impl HotResourceScheduler {
    pub fn new(kind: FlowKind) -> Self {
        Self {
            kind,
            config: RwLock::new(HotSchedulerConfig::default()),
        }
    }

    pub fn set_config(&self, config: HotSchedulerConfig) {
        *self.config.write().unwrap() = config;
    }

    fn load_kind(&self) -> ContainerLoadKind {
        match self.kind {
            FlowKind::Write => ContainerLoadKind::WriteBytes,
            FlowKind::Read => ContainerLoadKind::ReadBytes,
        }
    }

    fn hot_cache(&self, view: &ClusterView) -> Arc<RwLock<crate::statistics::HotPeerCache>> {
        match self.kind {
            FlowKind::Write => view.hot_write.clone(),
            FlowKind::Read => view.hot_read.clone(),
        }
    }

    fn schedule_write(
        &self,
        view: &ClusterView,
        hot: &HotPeerStat,
        config: &HotSchedulerConfig,
    ) -> Option<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();
        let stats = view.stats.read().unwrap();
        let res = cluster.get_resource(hot.resource_id)?;
        let source = hot.leader_container?;
        let src_load = stats.load(source, self.load_kind());

        let target = cluster
            .get_containers()
            .into_iter()
            .filter(|c| c.id() != source && res.container_peer(c.id()).is_none())
            .filter(|c| filter::hot_target_ok(c, &opts))
            .min_by(|a, b| {
                stats
                    .load(a.id(), self.load_kind())
                    .total_cmp(&stats.load(b.id(), self.load_kind()))
                    .then(a.id().cmp(&b.id()))
            })?;

        let dst_load = stats.load(target.id(), self.load_kind());
        if src_load <= dst_load * config.dst_tolerance_ratio {
            return None;
        }
        let new_peer_id = view.id_alloc.alloc().ok()?;
        builder::move_peer(
            self.name(),
            &res,
            source,
            target.id(),
            new_peer_id,
            OpKind::HOT_RESOURCE,
        )
        .map(|op| op.with_priority(OpPriority::High))
        .ok()
    }

    fn schedule_read(
        &self,
        view: &ClusterView,
        hot: &HotPeerStat,
        config: &HotSchedulerConfig,
    ) -> Option<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();
        let stats = view.stats.read().unwrap();
        let res = cluster.get_resource(hot.resource_id)?;
        let source = hot.leader_container?;
        let src_load = stats.load(source, self.load_kind());

        // Read pressure follows the leader: hand it to the coldest peer.
        let target = res
            .follower_peers()
            .iter()
            .filter_map(|p| cluster.get_container(p.container_id))
            .filter(|c| filter::can_receive_leader(c, &opts))
            .min_by(|a: &Arc<CachedContainer>, b| {
                stats
                    .load(a.id(), self.load_kind())
                    .total_cmp(&stats.load(b.id(), self.load_kind()))
                    .then(a.id().cmp(&b.id()))
            })?;

        let dst_load = stats.load(target.id(), self.load_kind());
        if src_load <= dst_load * config.dst_tolerance_ratio {
            return None;
        }
        builder::transfer_leader(self.name(), &res, target.id(), OpKind::HOT_RESOURCE)
            .map(|op| op.with_priority(OpPriority::High))
            .ok()
    }
}

impl Scheduler for HotResourceScheduler {
    fn name(&self) -> &str {
        match self.kind {
            FlowKind::Write => "hot-write-resource",
            FlowKind::Read => "hot-read-resource",
        }
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::HOT_RESOURCE) < opts.hot_resource_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let opts = view.options.snapshot();
        let config = self.config.read().unwrap().clone();
        let cache = self.hot_cache(view);

        for group in view.groups() {
            let hot_peers = cache.read().unwrap().hot_peers(group, &opts);
            for hot in hot_peers.iter().take(config.max_peer_count) {
                let op = match self.kind {
                    FlowKind::Write => self.schedule_write(view, hot, &config),
                    FlowKind::Read => self.schedule_read(view, hot, &config),
                };
                if let Some(op) = op {
                    return vec![op];
                }
            }
        }
        Vec::new()
    }
}
