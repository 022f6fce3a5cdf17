//! Randomized schedulers for admin use and chaos-style testing.

use rand::seq::{IteratorRandom, SliceRandom};

use crate::cluster::CachedResource;
use crate::meta::PeerRole;
use crate::schedule::filter;
use crate::schedule::{builder, ClusterView, OpKind, Operator, Scheduler};

/// Hand leadership to a random follower container.
pub struct ShuffleLeaderScheduler;

impl ShuffleLeaderScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ShuffleLeaderScheduler {
    fn name(&self) -> &str {
        "shuffle-leader"
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::LEADER) < opts.leader_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();
        let mut rng = rand::thread_rng();

        // Pick the new leader's home first, then a resource following there.
        let mut containers = cluster.get_containers();
        containers.shuffle(&mut rng);
        for target in containers {
            if !filter::can_receive_leader(&target, &opts) {
                continue;
            }
            let Some(res) =
                cluster.rand_follower_resource(target.id(), filter::resource_movable)
            else {
                continue;
            };
            match builder::transfer_leader(self.name(), &res, target.id(), OpKind::ADMIN) {
                Ok(op) => return vec![op],
                Err(err) => {
                    tracing::debug!(error = %err, "shuffle-leader candidate dropped");
                }
            }
        }
        Vec::new()
    }
}

/// Move a random peer of the configured roles to a random container.
pub struct ShuffleResourceScheduler {
    roles: Vec<String>,
}

impl ShuffleResourceScheduler {
    pub fn new(roles: Vec<String>) -> Self {
        Self { roles }
    }

    /// Args name the peer roles to shuffle; default is every role.
    pub fn from_args(args: &[String]) -> Self {
        let roles: Vec<String> = args
            .iter()
            .filter(|a| !a.is_empty())
            .map(|a| a.to_lowercase())
            .collect();
        if roles.is_empty() {
            Self::new(vec![
                "leader".to_string(),
                "follower".to_string(),
                "learner".to_string(),
            ])
        } else {
            Self::new(roles)
        }
    }

    fn pick_resource(
        &self,
        cluster: &crate::cluster::BasicCluster,
        container_id: u64,
    ) -> Option<(std::sync::Arc<CachedResource>, PeerRole)> {
        let mut rng = rand::thread_rng();
        let mut roles = self.roles.clone();
        roles.shuffle(&mut rng);
        for role in roles {
            let picked = match role.as_str() {
                "leader" => cluster
                    .rand_leader_resource(container_id, filter::resource_movable)
                    .map(|r| (r, PeerRole::Voter)),
                "follower" => cluster
                    .rand_follower_resource(container_id, filter::resource_movable)
                    .map(|r| (r, PeerRole::Voter)),
                "learner" => cluster
                    .learner_resources(container_id)
                    .into_iter()
                    .filter(|r| filter::resource_movable(r))
                    .choose(&mut rng)
                    .map(|r| (r, PeerRole::Learner)),
                _ => None,
            };
            if picked.is_some() {
                return picked;
            }
        }
        None
    }
}

impl Scheduler for ShuffleResourceScheduler {
    fn name(&self) -> &str {
        "shuffle-resource"
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::RESOURCE) < opts.resource_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();
        let mut rng = rand::thread_rng();

        let mut sources = cluster.get_containers();
        sources.shuffle(&mut rng);
        for source in sources {
            if !filter::container_online(&source) {
                continue;
            }
            let Some((res, role)) = self.pick_resource(&cluster, source.id()) else {
                continue;
            };
            let target = cluster
                .get_containers()
                .into_iter()
                .filter(|c| c.id() != source.id() && res.container_peer(c.id()).is_none())
                .filter(|c| filter::balance_target_ok(c, &opts))
                .choose(&mut rng);
            let Some(target) = target else {
                continue;
            };
            let Ok(new_peer_id) = view.id_alloc.alloc() else {
                return Vec::new();
            };
            let built = match role {
                PeerRole::Learner => builder::move_learner(
                    self.name(),
                    &res,
                    source.id(),
                    target.id(),
                    new_peer_id,
                    OpKind::ADMIN,
                ),
                _ => builder::move_peer(
                    self.name(),
                    &res,
                    source.id(),
                    target.id(),
                    new_peer_id,
                    OpKind::ADMIN,
                ),
            };
            match built {
                Ok(op) => return vec![op],
                Err(err) => {
                    tracing::debug!(error = %err, "shuffle-resource candidate dropped");
                }
            }
        }
        Vec::new()
    }
}

/// Move a random hot peer somewhere colder, at random.
pub struct ShuffleHotScheduler;

impl ShuffleHotScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ShuffleHotScheduler {
    fn name(&self) -> &str {
        "shuffle-hot-resource"
    }

    fn is_schedule_allowed(&self, view: &ClusterView) -> bool {
        let opts = view.options.snapshot();
        view.controller.operator_count(OpKind::HOT_RESOURCE) < opts.hot_resource_schedule_limit
    }

    fn schedule(&self, view: &ClusterView) -> Vec<Operator> {
        let opts = view.options.snapshot();
        let cluster = view.cluster.read().unwrap();
        let mut rng = rand::thread_rng();

        for group in view.groups() {
            let hot = view.hot_write.read().unwrap().hot_peers(group, &opts);
            let Some(stat) = hot.into_iter().choose(&mut rng) else {
                continue;
            };
            let Some(res) = cluster.get_resource(stat.resource_id) else {
                continue;
            };
            let Some(source) = stat.leader_container else {
                continue;
            };
            let target = cluster
                .get_containers()
                .into_iter()
                .filter(|c| c.id() != source && res.container_peer(c.id()).is_none())
                .filter(|c| filter::hot_target_ok(c, &opts))
                .choose(&mut rng);
            let Some(target) = target else {
                continue;
            };
            let Ok(new_peer_id) = view.id_alloc.alloc() else {
                return Vec::new();
            };
            match builder::move_peer(
                self.name(),
                &res,
                source,
                target.id(),
                new_peer_id,
                OpKind::HOT_RESOURCE | OpKind::ADMIN,
            ) {
                Ok(op) => return vec![op],
                Err(err) => {
                    tracing::debug!(error = %err, "shuffle-hot candidate dropped");
                }
            }
        }
        Vec::new()
    }
}
