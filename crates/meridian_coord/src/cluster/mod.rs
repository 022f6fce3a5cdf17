//! In-memory indexed view of the whole cluster.
//!
//! `BasicCluster` is the leader's authoritative cache. All mutations funnel
//! through one writer (the heartbeat applier or an admin handler holding the
//! write lock); every cached entity is an `Arc` snapshot replaced wholesale
//! on update, so readers never observe a torn record.

mod container;
mod resource;

pub use container::CachedContainer;
pub use resource::CachedResource;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use rand::seq::IteratorRandom;

use crate::meta::{
    ContainerId, ContainerMeta, ContainerState, ContainerStats, GroupId, PeerRole, ResourceId,
    ResourceMeta,
};

#[derive(Debug, Default)]
pub struct BasicCluster {
    containers: HashMap<ContainerId, Arc<CachedContainer>>,
    resources: HashMap<ResourceId, Arc<CachedResource>>,
    /// Range index: (group, start_key) -> resource id.
    ranges: BTreeMap<(GroupId, Vec<u8>), ResourceId>,
    leaders: HashMap<ContainerId, BTreeSet<ResourceId>>,
    followers: HashMap<ContainerId, BTreeSet<ResourceId>>,
    learners: HashMap<ContainerId, BTreeSet<ResourceId>>,
}

impl BasicCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn get_container(&self, id: ContainerId) -> Option<Arc<CachedContainer>> {
        self.containers.get(&id).cloned()
    }

    pub fn get_containers(&self) -> Vec<Arc<CachedContainer>> {
        let mut out: Vec<_> = self.containers.values().cloned().collect();
        out.sort_by_key(|c| c.id());
        out
    }

    pub fn get_resource(&self, id: ResourceId) -> Option<Arc<CachedResource>> {
        self.resources.get(&id).cloned()
    }

    pub fn get_resources(&self) -> Vec<Arc<CachedResource>> {
        let mut out: Vec<_> = self.resources.values().cloned().collect();
        out.sort_by_key(|r| r.id());
        out
    }

    /// Install a fully-specified container record, replacing any cached one.
    pub fn put_container(&mut self, container: CachedContainer) -> Arc<CachedContainer> {
        let container = Arc::new(container);
        self.containers.insert(container.id(), container.clone());
        container
    }

    /// Install or refresh container metadata, keeping accumulated stats and
    /// counters when the container is already cached.
    pub fn put_container_meta(&mut self, meta: ContainerMeta) -> Arc<CachedContainer> {
        let next = match self.containers.get(&meta.id) {
            Some(existing) => {
                let mut next = (**existing).clone();
                next.meta = meta;
                next
            }
            None => CachedContainer::new(meta),
        };
        let next = Arc::new(next);
        self.containers.insert(next.id(), next.clone());
        next
    }

    pub fn update_container_stats(&mut self, stats: ContainerStats) -> Option<Arc<CachedContainer>> {
        let existing = self.containers.get(&stats.container_id)?;
        let mut next = (**existing).clone();
        next.stats = stats;
        next.last_heartbeat = Some(Instant::now());
        let next = Arc::new(next);
        self.containers.insert(next.id(), next.clone());
        Some(next)
    }

    pub fn set_container_state(
        &mut self,
        id: ContainerId,
        state: ContainerState,
    ) -> anyhow::Result<Arc<CachedContainer>> {
        let Some(existing) = self.containers.get(&id) else {
            bail!("container {id} not found");
        };
        if existing.is_tombstone() && state != ContainerState::Tombstone {
            bail!("container {id} is tombstone and cannot return");
        }
        let mut next = (**existing).clone();
        next.meta.state = state;
        let next = Arc::new(next);
        self.containers.insert(id, next.clone());
        Ok(next)
    }

    pub fn pause_leader_transfer(&mut self, id: ContainerId) -> anyhow::Result<()> {
        let Some(existing) = self.containers.get(&id) else {
            bail!("container {id} not found");
        };
        if existing.paused_leader_transfer {
            bail!("leader transfer on container {id} already paused");
        }
        let mut next = (**existing).clone();
        next.paused_leader_transfer = true;
        self.containers.insert(id, Arc::new(next));
        Ok(())
    }

    pub fn resume_leader_transfer(&mut self, id: ContainerId) {
        if let Some(existing) = self.containers.get(&id) {
            if existing.paused_leader_transfer {
                let mut next = (**existing).clone();
                next.paused_leader_transfer = false;
                self.containers.insert(id, Arc::new(next));
            }
        }
    }

    /// Install a resource snapshot, refreshing every index and the counters
    /// of affected containers.
    pub fn put_resource(&mut self, res: CachedResource) -> Arc<CachedResource> {
        if let Some(old) = self.resources.remove(&res.id()) {
            self.unindex_resource(&old);
        }
        let res = Arc::new(res);
        self.index_resource(&res);
        self.resources.insert(res.id(), res.clone());
        res
    }

    pub fn remove_resource(&mut self, id: ResourceId) -> Option<Arc<CachedResource>> {
        let old = self.resources.remove(&id)?;
        self.unindex_resource(&old);
        Some(old)
    }

    fn index_resource(&mut self, res: &Arc<CachedResource>) {
        self.ranges
            .insert((res.meta.group, res.meta.start_key.clone()), res.id());
        let leader_container = res.leader_container();
        for peer in &res.meta.peers {
            let set = match peer.role {
                PeerRole::Learner => self.learners.entry(peer.container_id).or_default(),
                _ if Some(peer.container_id) == leader_container => {
                    self.leaders.entry(peer.container_id).or_default()
                }
                _ => self.followers.entry(peer.container_id).or_default(),
            };
            set.insert(res.id());
        }
        self.adjust_container_counters(res, 1);
    }

    fn unindex_resource(&mut self, res: &Arc<CachedResource>) {
        if self
            .ranges
            .get(&(res.meta.group, res.meta.start_key.clone()))
            == Some(&res.id())
        {
            self.ranges.remove(&(res.meta.group, res.meta.start_key.clone()));
        }
        for peer in &res.meta.peers {
            for sets in [&mut self.leaders, &mut self.followers, &mut self.learners] {
                if let Some(set) = sets.get_mut(&peer.container_id) {
                    set.remove(&res.id());
                }
            }
        }
        self.adjust_container_counters(res, -1);
    }

    fn adjust_container_counters(&mut self, res: &Arc<CachedResource>, sign: i64) {
        let group = res.meta.group;
        let size = res.approximate_size;
        let leader_container = res.leader_container();
        for peer in &res.meta.peers {
            let Some(existing) = self.containers.get(&peer.container_id) else {
                continue;
            };
            let mut next = (**existing).clone();
            bump(next.resource_counts.entry(group).or_default(), sign, 1);
            bump(next.resource_sizes.entry(group).or_default(), sign, size);
            if Some(peer.container_id) == leader_container {
                bump(next.leader_counts.entry(group).or_default(), sign, 1);
                bump(next.leader_sizes.entry(group).or_default(), sign, size);
            }
            if res.peer_is_pending(peer.id) {
                bump(next.pending_peer_counts.entry(group).or_default(), sign, 1);
            }
            self.containers.insert(peer.container_id, Arc::new(next));
        }
    }

    /// Resources led by `container_id`, id order.
    pub fn leader_resources(&self, container_id: ContainerId) -> Vec<Arc<CachedResource>> {
        self.collect(&self.leaders, container_id)
    }

    pub fn follower_resources(&self, container_id: ContainerId) -> Vec<Arc<CachedResource>> {
        self.collect(&self.followers, container_id)
    }

    pub fn learner_resources(&self, container_id: ContainerId) -> Vec<Arc<CachedResource>> {
        self.collect(&self.learners, container_id)
    }

    fn collect(
        &self,
        index: &HashMap<ContainerId, BTreeSet<ResourceId>>,
        container_id: ContainerId,
    ) -> Vec<Arc<CachedResource>> {
        index
            .get(&container_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.resources.get(id).cloned())
            .collect()
    }

    /// Random resource led by the container and passing `accept`.
    pub fn rand_leader_resource(
        &self,
        container_id: ContainerId,
        accept: impl Fn(&CachedResource) -> bool,
    ) -> Option<Arc<CachedResource>> {
        self.rand_from(&self.leaders, container_id, accept)
    }

    pub fn rand_follower_resource(
        &self,
        container_id: ContainerId,
        accept: impl Fn(&CachedResource) -> bool,
    ) -> Option<Arc<CachedResource>> {
        self.rand_from(&self.followers, container_id, accept)
    }

    fn rand_from(
        &self,
        index: &HashMap<ContainerId, BTreeSet<ResourceId>>,
        container_id: ContainerId,
        accept: impl Fn(&CachedResource) -> bool,
    ) -> Option<Arc<CachedResource>> {
        let mut rng = rand::thread_rng();
        index
            .get(&container_id)?
            .iter()
            .filter_map(|id| self.resources.get(id))
            .filter(|res| accept(res))
            .choose(&mut rng)
            .cloned()
    }

    /// Containers holding a follower peer of the resource.
    pub fn get_follower_containers(&self, res: &CachedResource) -> Vec<Arc<CachedContainer>> {
        res.follower_peers()
            .iter()
            .filter_map(|peer| self.containers.get(&peer.container_id).cloned())
            .collect()
    }

    /// Containers holding any peer of the resource.
    pub fn get_resource_containers(&self, res: &CachedResource) -> Vec<Arc<CachedContainer>> {
        res.meta
            .peers
            .iter()
            .filter_map(|peer| self.containers.get(&peer.container_id).cloned())
            .collect()
    }

    /// Resource whose range contains `key` within the group.
    pub fn search_resource(&self, group: GroupId, key: &[u8]) -> Option<Arc<CachedResource>> {
        let id = self
            .ranges
            .range(..=(group, key.to_vec()))
            .next_back()
            .filter(|((g, _), _)| *g == group)
            .map(|(_, id)| *id)?;
        let res = self.resources.get(&id)?;
        let inside = res.meta.end_key.is_empty() || key < res.meta.end_key.as_slice();
        inside.then(|| res.clone())
    }

    /// Resources overlapping `[start, end)` in start-key order, up to `limit`
    /// (0 means unlimited).
    pub fn scan_resources(
        &self,
        group: GroupId,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Vec<Arc<CachedResource>> {
        let mut out = Vec::new();
        for ((g, _), id) in self.ranges.range((group, start.to_vec())..) {
            if *g != group {
                break;
            }
            let Some(res) = self.resources.get(id) else {
                continue;
            };
            if !end.is_empty() && res.meta.start_key.as_slice() >= end {
                break;
            }
            out.push(res.clone());
            if limit > 0 && out.len() >= limit {
                break;
            }
        }
        out
    }

    pub fn average_resource_size(&self) -> u64 {
        if self.resources.is_empty() {
            return 0;
        }
        let total: u64 = self.resources.values().map(|r| r.approximate_size).sum();
        total / self.resources.len() as u64
    }
}

fn bump(slot: &mut u64, sign: i64, amount: u64) {
    if sign >= 0 {
        *slot += amount;
    } else {
        *slot = slot.saturating_sub(amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Epoch, Peer, ResourceState};
    use std::collections::BTreeMap;

    fn container_meta(id: u64) -> ContainerMeta {
        ContainerMeta {
            id,
            addr: format!("127.0.0.1:{}", 20000 + id),
            labels: BTreeMap::new(),
            state: ContainerState::Up,
            start_time: 0,
        }
    }

    fn resource(id: u64, containers: &[u64]) -> CachedResource {
        let peers: Vec<Peer> = containers
            .iter()
            .enumerate()
            .map(|(i, c)| Peer {
                id: id * 100 + i as u64,
                container_id: *c,
                role: PeerRole::Voter,
            })
            .collect();
        let leader = peers.first().copied();
        let mut res = CachedResource::new(
            ResourceMeta {
                id,
                group: 0,
                start_key: vec![id as u8],
                end_key: vec![id as u8 + 1],
                epoch: Epoch { conf_ver: 1, version: 1 },
                peers,
                labels: BTreeMap::new(),
                state: ResourceState::Running,
                rule_groups: vec![],
            },
            leader,
        );
        res.approximate_size = 10;
        res
    }

    fn cluster_with(resources: &[(u64, &[u64])]) -> BasicCluster {
        let mut cluster = BasicCluster::new();
        for id in 1..=4 {
            cluster.put_container_meta(container_meta(id));
        }
        for (id, containers) in resources {
            cluster.put_resource(resource(*id, containers));
        }
        cluster
    }

    #[test]
    fn counters_follow_resource_placement() {
        let cluster = cluster_with(&[(1, &[1, 2, 3]), (2, &[2, 3, 4])]);
        let c2 = cluster.get_container(2).unwrap();
        assert_eq!(c2.resource_count(0), 2);
        assert_eq!(c2.leader_count(0), 1);
        assert_eq!(c2.resource_size(0), 20);
        let c4 = cluster.get_container(4).unwrap();
        assert_eq!(c4.leader_count(0), 0);
    }

    #[test]
    fn reinstalling_a_resource_does_not_double_count() {
        let mut cluster = cluster_with(&[(1, &[1, 2, 3])]);
        cluster.put_resource(resource(1, &[1, 2, 3]));
        let c1 = cluster.get_container(1).unwrap();
        assert_eq!(c1.resource_count(0), 1);
        assert_eq!(c1.leader_count(0), 1);
    }

    #[test]
    fn leader_move_updates_indices() {
        let mut cluster = cluster_with(&[(1, &[1, 2, 3])]);
        assert_eq!(cluster.leader_resources(1).len(), 1);

        let mut moved = resource(1, &[1, 2, 3]);
        moved.leader = Some(moved.meta.peers[1]);
        cluster.put_resource(moved);

        assert!(cluster.leader_resources(1).is_empty());
        assert_eq!(cluster.leader_resources(2).len(), 1);
        assert_eq!(cluster.follower_resources(1).len(), 1);
        assert_eq!(cluster.get_container(2).unwrap().leader_count(0), 1);
        assert_eq!(cluster.get_container(1).unwrap().leader_count(0), 0);
    }

    #[test]
    fn search_respects_range_bounds() {
        let cluster = cluster_with(&[(1, &[1, 2]), (3, &[2, 3])]);
        assert_eq!(cluster.search_resource(0, &[1]).unwrap().id(), 1);
        // Key 2 falls in the gap between resource 1 ([1,2)) and resource 3 ([3,4)).
        assert!(cluster.search_resource(0, &[2]).is_none());
        assert_eq!(cluster.search_resource(0, &[3]).unwrap().id(), 3);
        assert!(cluster.search_resource(1, &[1]).is_none());
    }

    #[test]
    fn scan_is_ordered_and_bounded() {
        let cluster = cluster_with(&[(3, &[1]), (1, &[1]), (2, &[1])]);
        let ids: Vec<u64> = cluster
            .scan_resources(0, &[], &[], 0)
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let ids: Vec<u64> = cluster
            .scan_resources(0, &[2], &[], 1)
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn remove_resource_clears_counters() {
        let mut cluster = cluster_with(&[(1, &[1, 2, 3])]);
        cluster.remove_resource(1);
        assert_eq!(cluster.get_container(1).unwrap().resource_count(0), 0);
        assert!(cluster.leader_resources(1).is_empty());
        assert!(cluster.search_resource(0, &[1]).is_none());
    }
}
