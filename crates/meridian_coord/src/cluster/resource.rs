//! Cached view of one resource.

use crate::meta::{ContainerId, Peer, PeerRole, PeerStats, ResourceMeta};

/// Immutable snapshot of a resource: the reported meta plus the leader,
/// replica health and flow figures from the latest accepted heartbeat.
#[derive(Debug, Clone)]
pub struct CachedResource {
    pub meta: ResourceMeta,
    pub leader: Option<Peer>,
    pub down_peers: Vec<PeerStats>,
    pub pending_peers: Vec<Peer>,
    pub written_bytes: u64,
    pub written_keys: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
    pub approximate_size: u64,
    /// Report window length in seconds; flow rates divide by this.
    pub interval_secs: u64,
}

impl CachedResource {
    pub fn new(meta: ResourceMeta, leader: Option<Peer>) -> Self {
        Self {
            meta,
            leader,
            down_peers: Vec::new(),
            pending_peers: Vec::new(),
            written_bytes: 0,
            written_keys: 0,
            read_bytes: 0,
            read_keys: 0,
            approximate_size: 0,
            interval_secs: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn leader_container(&self) -> Option<ContainerId> {
        self.leader.as_ref().map(|p| p.container_id)
    }

    pub fn peer(&self, peer_id: u64) -> Option<&Peer> {
        self.meta.peer(peer_id)
    }

    pub fn container_peer(&self, container_id: ContainerId) -> Option<&Peer> {
        self.meta.container_peer(container_id)
    }

    /// Voter peers other than the leader.
    pub fn follower_peers(&self) -> Vec<&Peer> {
        let leader_id = self.leader.as_ref().map(|p| p.id);
        self.meta
            .peers
            .iter()
            .filter(|p| {
                matches!(p.role, PeerRole::Voter | PeerRole::IncomingVoter)
                    && Some(p.id) != leader_id
            })
            .collect()
    }

    pub fn learner_peers(&self) -> Vec<&Peer> {
        self.meta
            .peers
            .iter()
            .filter(|p| p.role == PeerRole::Learner)
            .collect()
    }

    pub fn peer_is_pending(&self, peer_id: u64) -> bool {
        self.pending_peers.iter().any(|p| p.id == peer_id)
    }

    pub fn peer_is_down(&self, peer_id: u64) -> bool {
        self.down_peers.iter().any(|p| p.peer.id == peer_id)
    }

    /// Healthy enough to move: replicas are reachable, caught up, and not
    /// mid-membership-change.
    pub fn is_healthy(&self) -> bool {
        self.down_peers.is_empty()
            && self.pending_peers.is_empty()
            && !self.meta.in_joint_state()
    }

    pub fn write_rate_bytes(&self) -> f64 {
        rate(self.written_bytes, self.interval_secs)
    }

    pub fn write_rate_keys(&self) -> f64 {
        rate(self.written_keys, self.interval_secs)
    }

    pub fn read_rate_bytes(&self) -> f64 {
        rate(self.read_bytes, self.interval_secs)
    }

    pub fn read_rate_keys(&self) -> f64 {
        rate(self.read_keys, self.interval_secs)
    }
}

fn rate(total: u64, secs: u64) -> f64 {
    if secs == 0 {
        return 0.0;
    }
    total as f64 / secs as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Epoch, ResourceState};
    use std::collections::BTreeMap;

    fn peer(id: u64, container_id: u64, role: PeerRole) -> Peer {
        Peer { id, container_id, role }
    }

    fn resource(peers: Vec<Peer>) -> CachedResource {
        let leader = peers.first().copied();
        CachedResource::new(
            ResourceMeta {
                id: 1,
                group: 0,
                start_key: vec![],
                end_key: vec![],
                epoch: Epoch::default(),
                peers,
                labels: BTreeMap::new(),
                state: ResourceState::Running,
                rule_groups: vec![],
            },
            leader,
        )
    }

    #[test]
    fn followers_exclude_leader_and_learners() {
        let res = resource(vec![
            peer(1, 10, PeerRole::Voter),
            peer(2, 20, PeerRole::Voter),
            peer(3, 30, PeerRole::Learner),
        ]);
        let followers: Vec<u64> = res.follower_peers().iter().map(|p| p.id).collect();
        assert_eq!(followers, vec![2]);
        assert_eq!(res.learner_peers().len(), 1);
    }

    #[test]
    fn joint_state_resources_are_unhealthy() {
        let res = resource(vec![
            peer(1, 10, PeerRole::DemotingVoter),
            peer(2, 20, PeerRole::IncomingVoter),
        ]);
        assert!(!res.is_healthy());
    }

    #[test]
    fn flow_rates_divide_by_interval() {
        let mut res = resource(vec![peer(1, 10, PeerRole::Voter)]);
        res.written_bytes = 600;
        res.interval_secs = 60;
        assert_eq!(res.write_rate_bytes(), 10.0);
    }
}
