//! Shared fixtures: an in-memory cluster builder in the spirit of the
//! planners' own unit fixtures, plus a full in-process coordinator for
//! client/server tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;

use meridian_coord::cluster::{BasicCluster, CachedContainer, CachedResource};
use meridian_coord::config::{ScheduleOptions, SharedOptions};
use meridian_coord::heartbeat;
use meridian_coord::meta::{
    ContainerMeta, ContainerState, ContainerStats, Epoch, Peer, PeerRole, ResourceMeta,
    ResourceState,
};
use meridian_coord::node::CoordState;
use meridian_coord::placement::RuleManager;
use meridian_coord::schedule::{ClusterView, OperatorController};
use meridian_coord::server::Server;
use meridian_coord::statistics::{
    ContainersStats, FlowKind, HotPeerCache, CONTAINER_HEARTBEAT_INTERVAL,
    RESOURCE_HEARTBEAT_INTERVAL,
};
use meridian_coord::storage::{KvBackend, MemBackend, MetaStorage, SeqIdAllocator};
use meridian_election::{Election, ElectionHub, Member};

pub const MB: u64 = 1024 * 1024;
pub const KB: u64 = 1024;

/// Scheduler-facing cluster fixture.
pub struct TestCluster {
    pub view: ClusterView,
}

impl TestCluster {
    pub fn new() -> Self {
        let mut opts = ScheduleOptions::default();
        // Tests drive the hot cache with single observations.
        opts.hot_cache_hits_threshold = 0;
        let options = SharedOptions::new(opts);
        let view = ClusterView {
            cluster: Arc::new(RwLock::new(BasicCluster::new())),
            stats: Arc::new(RwLock::new(ContainersStats::default())),
            hot_write: Arc::new(RwLock::new(HotPeerCache::new(FlowKind::Write))),
            hot_read: Arc::new(RwLock::new(HotPeerCache::new(FlowKind::Read))),
            rules: Arc::new(RuleManager::new(3)),
            options,
            controller: Arc::new(OperatorController::new()),
            id_alloc: Arc::new(SeqIdAllocator::starting_at(10_000)),
        };
        Self { view }
    }

    pub fn options(&self) -> &SharedOptions {
        &self.view.options
    }

    fn base_container(id: u64, labels: &[(&str, &str)]) -> CachedContainer {
        let mut container = CachedContainer::new(ContainerMeta {
            id,
            addr: format!("127.0.0.1:{}", 20000 + id),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            state: ContainerState::Up,
            start_time: 0,
        });
        container.stats = ContainerStats {
            container_id: id,
            capacity: 100 * 1024 * MB,
            used_size: 10 * 1024 * MB,
            available: 90 * 1024 * MB,
            ..Default::default()
        };
        container.last_heartbeat = Some(Instant::now());
        container
    }

    pub fn add_container(&self, id: u64) {
        self.add_labels_container(id, &[]);
    }

    pub fn add_labels_container(&self, id: u64, labels: &[(&str, &str)]) {
        let container = Self::base_container(id, labels);
        self.view.cluster.write().unwrap().put_container(container);
    }

    pub fn set_container_disconnected(&self, id: u64) {
        let mut cluster = self.view.cluster.write().unwrap();
        let existing = cluster.get_container(id).expect("container exists");
        let mut next = (*existing).clone();
        next.last_heartbeat = Some(Instant::now() - CONTAINER_HEARTBEAT_INTERVAL * 10);
        cluster.put_container(next);
    }

    pub fn set_container_up(&self, id: u64) {
        let mut cluster = self.view.cluster.write().unwrap();
        let existing = cluster.get_container(id).expect("container exists");
        let mut next = (*existing).clone();
        next.last_heartbeat = Some(Instant::now());
        cluster.put_container(next);
    }

    /// `containers[0]` leads; the rest follow.
    pub fn add_leader_resource(&self, id: u64, containers: &[u64]) {
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
        self.view.cluster.write().unwrap().put_resource(res);
    }

    /// Mark a peer of the resource as pending.
    pub fn set_pending_peer(&self, resource_id: u64, container_id: u64) {
        let mut cluster = self.view.cluster.write().unwrap();
        let existing = cluster.get_resource(resource_id).expect("resource exists");
        let mut next = (*existing).clone();
        let peer = *next.container_peer(container_id).expect("peer exists");
        next.pending_peers.push(peer);
        cluster.put_resource(next);
    }

    /// Report container-level written bytes over one heartbeat interval.
    pub fn update_storage_written_bytes(&self, container_id: u64, bytes: u64) {
        self.view.stats.write().unwrap().observe(&ContainerStats {
            container_id,
            written_bytes: bytes,
            interval_start: 0,
            interval_end: CONTAINER_HEARTBEAT_INTERVAL.as_secs(),
            ..Default::default()
        });
    }

    pub fn update_storage_read_bytes(&self, container_id: u64, bytes: u64) {
        self.view.stats.write().unwrap().observe(&ContainerStats {
            container_id,
            read_bytes: bytes,
            interval_start: 0,
            interval_end: CONTAINER_HEARTBEAT_INTERVAL.as_secs(),
            ..Default::default()
        });
    }

    /// Leader resource whose write flow feeds the hot cache.
    pub fn add_leader_resource_with_write_info(
        &self,
        id: u64,
        leader_container: u64,
        followers: &[u64],
        written_bytes: u64,
    ) {
        let mut containers = vec![leader_container];
        containers.extend_from_slice(followers);
        self.add_leader_resource(id, &containers);

        let mut cluster = self.view.cluster.write().unwrap();
        let existing = cluster.get_resource(id).expect("resource exists");
        let mut next = (*existing).clone();
        next.written_bytes = written_bytes;
        next.interval_secs = RESOURCE_HEARTBEAT_INTERVAL.as_secs();
        let cached = cluster.put_resource(next);
        drop(cluster);

        let opts = self.view.options.snapshot();
        self.view.hot_write.write().unwrap().observe(&cached, &opts);
    }

    pub fn add_leader_resource_with_read_info(
        &self,
        id: u64,
        leader_container: u64,
        followers: &[u64],
        read_bytes: u64,
    ) {
        let mut containers = vec![leader_container];
        containers.extend_from_slice(followers);
        self.add_leader_resource(id, &containers);

        let mut cluster = self.view.cluster.write().unwrap();
        let existing = cluster.get_resource(id).expect("resource exists");
        let mut next = (*existing).clone();
        next.read_bytes = read_bytes;
        next.interval_secs = RESOURCE_HEARTBEAT_INTERVAL.as_secs();
        let cached = cluster.put_resource(next);
        drop(cluster);

        let opts = self.view.options.snapshot();
        self.view.hot_read.write().unwrap().observe(&cached, &opts);
    }
}

/// One in-process coordinator (election + state + rpc server).
pub struct TestCoordinator {
    pub state: Arc<CoordState>,
    pub election: Arc<Election>,
    pub addr: std::net::SocketAddr,
    server_handle: tokio::task::JoinHandle<()>,
    applier_handle: tokio::task::JoinHandle<()>,
}

impl TestCoordinator {
    /// Start a coordinator sharing `hub` and `backend` with its peers.
    pub async fn start(id: u64, hub: Arc<ElectionHub>, backend: Arc<dyn KvBackend>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let member = Member {
            id,
            name: format!("coord-{id}"),
            addr: addr.to_string(),
        };
        let election = Election::start(hub, member);
        let storage = MetaStorage::new(backend);
        let state = CoordState::new(
            election.clone(),
            storage,
            SharedOptions::new(ScheduleOptions::default()),
        );

        meridian_coord::node::spawn_leader_watch(state.clone());
        let (hb_tx, applier_handle) = heartbeat::spawn_applier(state.clone());
        let server = Server::new(state.clone(), hb_tx);
        let server_handle = tokio::spawn(async move {
            server.serve(listener).await;
        });

        Self {
            state,
            election,
            addr,
            server_handle,
            applier_handle,
        }
    }

    pub async fn wait_leader(&self) {
        for _ in 0..200 {
            if self.state.ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("coordinator {} never became leader", self.election.member().id);
    }

    pub fn stop(&self) {
        self.election.stop();
        self.server_handle.abort();
        self.applier_handle.abort();
    }
}

pub fn shared_backend() -> Arc<dyn KvBackend> {
    Arc::new(MemBackend::new())
}

pub fn container_meta(id: u64) -> ContainerMeta {
    ContainerMeta {
        id,
        addr: format!("127.0.0.1:{}", 20000 + id),
        labels: BTreeMap::new(),
        state: ContainerState::Up,
        start_time: 0,
    }
}

pub fn container_stats(id: u64, resource_count: u64) -> ContainerStats {
    ContainerStats {
        container_id: id,
        capacity: 100 * 1024 * MB,
        used_size: resource_count * 10 * MB,
        available: 100 * 1024 * MB - resource_count * 10 * MB,
        resource_count,
        interval_start: 0,
        interval_end: CONTAINER_HEARTBEAT_INTERVAL.as_secs(),
        ..Default::default()
    }
}

pub fn resource_meta(id: u64, containers: &[u64]) -> ResourceMeta {
    ResourceMeta {
        id,
        group: 0,
        start_key: vec![id as u8],
        end_key: vec![id as u8 + 1],
        epoch: Epoch { conf_ver: 1, version: 1 },
        peers: containers
            .iter()
            .enumerate()
            .map(|(i, c)| Peer {
                id: id * 100 + i as u64,
                container_id: *c,
                role: PeerRole::Voter,
            })
            .collect(),
        labels: BTreeMap::new(),
        state: ResourceState::Running,
        rule_groups: vec![],
    }
}
