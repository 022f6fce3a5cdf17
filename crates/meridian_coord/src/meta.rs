//! Cluster metadata: containers, resources, peers, epochs, jobs.
//!
//! These are the persisted/wire shapes. Ids are the only cross-references;
//! everything resolves through the cluster cache.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type ContainerId = u64;
pub type ResourceId = u64;
pub type PeerId = u64;
pub type GroupId = u64;

/// Container lifecycle state. `Tombstone` is terminal and only entered
/// through an admin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Up,
    Offline,
    Tombstone,
}

/// An addressable storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub id: ContainerId,
    pub addr: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
    /// Unix seconds the process started, self-reported.
    #[serde(default)]
    pub start_time: u64,
}

impl ContainerMeta {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Point-in-time usage figures a container reports with its heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: ContainerId,
    pub capacity: u64,
    pub used_size: u64,
    pub available: u64,
    pub resource_count: u64,
    pub sending_snap_count: u64,
    pub receiving_snap_count: u64,
    pub is_busy: bool,
    pub written_bytes: u64,
    pub written_keys: u64,
    pub read_bytes: u64,
    pub read_keys: u64,
    /// Covered report window, unix seconds.
    pub interval_start: u64,
    pub interval_end: u64,
}

/// Replica role. The `Incoming`/`Demoting` pair only appears inside a joint
/// consensus membership change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    #[default]
    Voter,
    Learner,
    IncomingVoter,
    DemotingVoter,
}

impl PeerRole {
    pub fn in_joint_state(self) -> bool {
        matches!(self, PeerRole::IncomingVoter | PeerRole::DemotingVoter)
    }
}

/// One replica of a resource on a specific container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub container_id: ContainerId,
    #[serde(default)]
    pub role: PeerRole,
}

/// `(conf_ver, version)`: conf_ver bumps on membership change, version on
/// split/merge. Orders concurrent observations of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub conf_ver: u64,
    pub version: u64,
}

impl Epoch {
    /// Whether `self` is stale relative to `other` (strictly older in either
    /// component).
    pub fn stale(&self, other: &Epoch) -> bool {
        self.version < other.version || self.conf_ver < other.conf_ver
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    #[default]
    Running,
    Destroying,
    Destroyed,
}

/// A contiguous key range `[start, end)` inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub id: ResourceId,
    pub group: GroupId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub epoch: Epoch,
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub state: ResourceState,
    /// Placement-rule groups this resource opts into; empty means every
    /// overlapping rule applies.
    #[serde(default)]
    pub rule_groups: Vec<String>,
}

impl ResourceMeta {
    pub fn peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn container_peer(&self, container_id: ContainerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.container_id == container_id)
    }

    pub fn in_joint_state(&self) -> bool {
        self.peers.iter().any(|p| p.role.in_joint_state())
    }

    /// The multiset of peers keyed by container, used to detect divergent
    /// reports at the same conf_ver.
    pub fn peer_fingerprint(&self) -> Vec<(ContainerId, PeerId)> {
        let mut out: Vec<_> = self.peers.iter().map(|p| (p.container_id, p.id)).collect();
        out.sort_unstable();
        out
    }
}

/// A down replica with how long it has been unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub peer: Peer,
    pub down_seconds: u64,
}

/// Two-phase destroy bookkeeping persisted under `/destroying/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyingStatus {
    pub state: ResourceState,
    pub index: u64,
    pub remove_data: bool,
    /// replica id -> has reported destruction
    pub replicas: BTreeMap<PeerId, bool>,
}

impl DestroyingStatus {
    pub fn all_reported(&self) -> bool {
        !self.replicas.is_empty() && self.replicas.values().all(|done| *done)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    Created,
    Working,
    Completed,
    Removing,
}

/// An admin job executed on the leader by a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub kind: u64,
    #[serde(default)]
    pub content: Vec<u8>,
    #[serde(default)]
    pub state: JobState,
}

/// Groups resources by a label so schedulers treat each value independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleGroupRule {
    pub group_id: GroupId,
    pub name: String,
    pub group_by_label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_staleness_is_componentwise() {
        let current = Epoch { conf_ver: 3, version: 5 };
        assert!(Epoch { conf_ver: 2, version: 5 }.stale(&current));
        assert!(Epoch { conf_ver: 3, version: 4 }.stale(&current));
        assert!(!Epoch { conf_ver: 3, version: 5 }.stale(&current));
        assert!(!Epoch { conf_ver: 4, version: 6 }.stale(&current));
    }

    #[test]
    fn peer_fingerprint_ignores_order() {
        let mut meta = ResourceMeta {
            id: 1,
            group: 0,
            start_key: vec![],
            end_key: vec![],
            epoch: Epoch::default(),
            peers: vec![
                Peer { id: 2, container_id: 20, role: PeerRole::Voter },
                Peer { id: 1, container_id: 10, role: PeerRole::Voter },
            ],
            labels: BTreeMap::new(),
            state: ResourceState::Running,
            rule_groups: vec![],
        };
        let a = meta.peer_fingerprint();
        meta.peers.reverse();
        assert_eq!(a, meta.peer_fingerprint());
    }
}
