//! Coordinator node state and request handling.
//!
//! `CoordState` owns the leader-side world: metadata storage, the cluster
//! cache, statistics, rules, the operator controller and the watcher hub.
//! The RPC server and the heartbeat applier both dispatch into it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use meridian_election::Election;
use tokio::sync::mpsc;

use crate::cluster::{BasicCluster, CachedResource};
use crate::config::SharedOptions;
use crate::event::{Event, WatcherHub};
use crate::jobs::JobRegistry;
use crate::meta::{
    ContainerId, ContainerMeta, ContainerState, ContainerStats, DestroyingStatus, Job, JobState,
    Peer, PeerRole, ResourceId, ResourceMeta, ResourceState, ScheduleGroupRule,
};
use crate::placement::RuleManager;
use crate::rpc::{
    ContainerHeartbeatRsp, Request, RequestBody, ResourceHeartbeatReq, ResourceHeartbeatRsp,
    Response, ResponseBody, SplitId, WireError,
};
use crate::schedule::{ClusterView, OperatorController};
use crate::statistics::{collect_summary, ContainersStats, FlowKind, HotPeerCache};
use crate::storage::MetaStorage;

pub struct CoordState {
    pub election: Arc<Election>,
    pub storage: MetaStorage,
    pub cluster: Arc<RwLock<BasicCluster>>,
    pub stats: Arc<RwLock<ContainersStats>>,
    pub hot_write: Arc<RwLock<HotPeerCache>>,
    pub hot_read: Arc<RwLock<HotPeerCache>>,
    pub rules: Arc<RuleManager>,
    pub group_rules: RwLock<Vec<ScheduleGroupRule>>,
    pub options: SharedOptions,
    pub controller: Arc<OperatorController>,
    pub watchers: WatcherHub,
    pub jobs: JobRegistry,
    /// Container sessions registered for server push.
    pub sessions: Mutex<HashMap<ContainerId, mpsc::UnboundedSender<Response>>>,
    cache_loaded: AtomicBool,
}

impl CoordState {
    pub fn new(election: Arc<Election>, storage: MetaStorage, options: SharedOptions) -> Arc<Self> {
        let max_replicas = options.snapshot().max_replicas;
        Arc::new(Self {
            election,
            storage,
            cluster: Arc::new(RwLock::new(BasicCluster::new())),
            stats: Arc::new(RwLock::new(ContainersStats::default())),
            hot_write: Arc::new(RwLock::new(HotPeerCache::new(FlowKind::Write))),
            hot_read: Arc::new(RwLock::new(HotPeerCache::new(FlowKind::Read))),
            rules: Arc::new(RuleManager::new(max_replicas)),
            group_rules: RwLock::new(Vec::new()),
            options,
            controller: Arc::new(OperatorController::new()),
            watchers: WatcherHub::new(),
            jobs: JobRegistry::new(),
            sessions: Mutex::new(HashMap::new()),
            cache_loaded: AtomicBool::new(false),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Whether this node leads *and* has finished loading the authoritative
    /// state. Requests are refused with `NotLeader` until both hold, so a
    /// freshly elected leader never serves from an empty cache.
    pub fn ready(&self) -> bool {
        self.is_leader() && self.cache_loaded.load(Ordering::Acquire)
    }

    /// Fatal-path escape hatch: release leadership so another coordinator
    /// can take over.
    pub fn step_down(&self, why: &str) {
        tracing::error!(why, "stepping down from leadership");
        self.cache_loaded.store(false, Ordering::Release);
        self.election.resign();
    }

    /// Load the authoritative state into memory after winning the election.
    pub fn load_cluster(&self) -> anyhow::Result<()> {
        let containers = self.storage.load_containers()?;
        let resources = self.storage.load_resources()?;
        let rules = self.storage.load_rules()?;
        let group_rules = self.storage.load_group_rules()?;

        {
            let mut cluster = self.cluster.write().unwrap();
            *cluster = BasicCluster::new();
            for meta in containers {
                cluster.put_container_meta(meta);
            }
            for meta in resources {
                let leader = meta.peers.first().copied();
                cluster.put_resource(CachedResource::new(meta, leader));
            }
        }
        if !rules.is_empty() {
            self.rules.load(rules);
        }
        *self.group_rules.write().unwrap() = group_rules;
        self.cache_loaded.store(true, Ordering::Release);
        tracing::info!(
            containers = self.cluster.read().unwrap().container_count(),
            resources = self.cluster.read().unwrap().resource_count(),
            "cluster cache loaded"
        );
        Ok(())
    }

    pub fn view(self: &Arc<Self>) -> ClusterView {
        ClusterView {
            cluster: self.cluster.clone(),
            stats: self.stats.clone(),
            hot_write: self.hot_write.clone(),
            hot_read: self.hot_read.clone(),
            rules: self.rules.clone(),
            options: self.options.clone(),
            controller: self.controller.clone(),
            id_alloc: Arc::new(self.storage.clone()),
        }
    }

    /// Snapshot event for a fresh watcher.
    pub fn init_event(&self) -> Event {
        let cluster = self.cluster.read().unwrap();
        Event::Init {
            containers: cluster
                .get_containers()
                .iter()
                .map(|c| c.meta.clone())
                .collect(),
            resources: cluster
                .get_resources()
                .iter()
                .map(|r| r.meta.clone())
                .collect(),
        }
    }

    /// Handle every request kind that does not need connection context.
    pub fn handle_request(&self, req: Request) -> Response {
        if !self.ready() {
            return Response::err(req.id, WireError::NotLeader);
        }
        let id = req.id;
        let result = match req.body {
            RequestBody::AllocId => self
                .storage
                .alloc_ids(1)
                .map(|id| ResponseBody::AllocId { id })
                .map_err(WireError::internal),
            RequestBody::PutContainer { container } => self.put_container(container),
            RequestBody::GetContainer { container_id } => self.get_container(container_id),
            RequestBody::AskBatchSplit { resource, count } => {
                self.ask_batch_split(resource, count)
            }
            RequestBody::CreateResources { resources, least_replicas } => {
                self.create_resources(resources, least_replicas)
            }
            RequestBody::RemoveResources { ids } => self.remove_resources(ids),
            RequestBody::CheckResourceState { ids } => self.check_resource_state(ids),
            RequestBody::PutPlacementRule { rule } => self.put_placement_rule(rule),
            RequestBody::GetAppliedRules { resource_id } => self.get_applied_rules(resource_id),
            RequestBody::AddScheduleGroupRule { rule } => self.add_schedule_group_rule(rule),
            RequestBody::GetScheduleGroupRule => Ok(ResponseBody::GetScheduleGroupRule {
                rules: self.group_rules.read().unwrap().clone(),
            }),
            RequestBody::CreateJob { job } => self.create_job(job),
            RequestBody::RemoveJob { job } => self.remove_job(job),
            RequestBody::ExecuteJob { job, data } => self
                .jobs
                .execute(&job, &data)
                .map(|data| ResponseBody::ExecuteJob { data })
                .map_err(WireError::internal),
            RequestBody::CreateDestroying { id, index, remove_data, replicas } => {
                self.create_destroying(id, index, remove_data, replicas)
            }
            RequestBody::ReportDestroyed { id, replica_id } => {
                self.report_destroyed(id, replica_id)
            }
            RequestBody::GetDestroying { id } => self
                .storage
                .get_destroying(id)
                .map(|status| ResponseBody::GetDestroying { status })
                .map_err(WireError::internal),
            RequestBody::ContainerHeartbeat { .. }
            | RequestBody::ResourceHeartbeat(_)
            | RequestBody::RegisterContainer { .. }
            | RequestBody::Watch { .. } => {
                Err(WireError::internal("request requires connection context"))
            }
        };
        match result {
            Ok(body) => Response::ok(id, body),
            Err(err) => Response::err(id, err),
        }
    }

    fn put_container(&self, meta: ContainerMeta) -> Result<ResponseBody, WireError> {
        if meta.id == 0 || meta.addr.is_empty() {
            return Err(WireError::internal("container requires an id and an address"));
        }
        if let Some(existing) = self.cluster.read().unwrap().get_container(meta.id) {
            if existing.is_tombstone() {
                return Err(WireError::StoreNotMatch);
            }
            if existing.meta.addr != meta.addr && existing.meta.state == ContainerState::Up {
                tracing::info!(
                    container = meta.id,
                    old = %existing.meta.addr,
                    new = %meta.addr,
                    "container re-registered with a new address"
                );
            }
        }
        self.storage
            .put_container(&meta)
            .map_err(WireError::internal)?;
        self.cluster.write().unwrap().put_container_meta(meta.clone());
        self.watchers.notify(Event::ContainerChanged(meta));
        Ok(ResponseBody::Empty)
    }

    fn get_container(&self, container_id: ContainerId) -> Result<ResponseBody, WireError> {
        if let Some(cached) = self.cluster.read().unwrap().get_container(container_id) {
            return Ok(ResponseBody::GetContainer { container: cached.meta.clone() });
        }
        match self.storage.get_container(container_id) {
            Ok(Some(meta)) => Ok(ResponseBody::GetContainer { container: meta }),
            Ok(None) => Err(WireError::internal(format!(
                "container {container_id} not found"
            ))),
            Err(err) => Err(WireError::internal(err)),
        }
    }

    /// Container heartbeat: refresh stats, then hand back any pending
    /// operator steps for shards this container leads.
    pub fn handle_container_heartbeat(
        &self,
        stats: ContainerStats,
    ) -> Result<ContainerHeartbeatRsp, WireError> {
        if !self.ready() {
            return Err(WireError::NotLeader);
        }
        let container_id = stats.container_id;
        {
            let mut cluster = self.cluster.write().unwrap();
            if cluster.update_container_stats(stats.clone()).is_none() {
                return Err(WireError::internal(format!(
                    "container {container_id} is not registered"
                )));
            }
        }
        self.stats.write().unwrap().observe(&stats);

        let cluster = self.cluster.clone();
        let steps = self.controller.pending_steps_for_container(container_id, |id| {
            cluster.read().unwrap().get_resource(id).map(|r| (*r).clone())
        });
        Ok(ContainerHeartbeatRsp { steps })
    }

    /// Resource heartbeat: validate the epoch, fold the report into the
    /// cache and statistics, emit watcher events, advance any operator.
    pub fn handle_resource_heartbeat(
        &self,
        req: ResourceHeartbeatReq,
    ) -> Result<ResourceHeartbeatRsp, WireError> {
        if !self.ready() {
            return Err(WireError::NotLeader);
        }
        let mut meta = req.resource;
        let resource_id = meta.id;

        // A destroyed resource tells its replicas to clean up directly.
        if let Ok(Some(status)) = self.storage.get_destroying(resource_id) {
            if status.state == ResourceState::Destroyed {
                return Ok(ResourceHeartbeatRsp {
                    resource_id,
                    step: None,
                    destroy_directly: status.remove_data,
                });
            }
        }

        let opts = self.options.snapshot();
        let (created, epoch_changed, cached) = {
            let mut cluster = self.cluster.write().unwrap();
            let existing = cluster.get_resource(resource_id);
            if let Some(existing) = &existing {
                let current = existing.meta.epoch;
                if meta.epoch.stale(&current) {
                    return Err(WireError::StaleCommand);
                }
                if meta.epoch.conf_ver == current.conf_ver
                    && meta.peer_fingerprint() != existing.meta.peer_fingerprint()
                {
                    tracing::warn!(
                        resource = resource_id,
                        "divergent peer set at an unchanged conf version, report discarded"
                    );
                    return Err(WireError::StaleEpoch {
                        new_shards: vec![existing.meta.clone()],
                    });
                }
            }

            self.assign_schedule_group(&mut meta);
            let mut cached = CachedResource::new(meta, req.leader);
            cached.down_peers = req.down_peers;
            cached.pending_peers = req.pending_peers;
            cached.written_bytes = req.written_bytes;
            cached.written_keys = req.written_keys;
            cached.read_bytes = req.read_bytes;
            cached.read_keys = req.read_keys;
            cached.approximate_size = req.approximate_size;
            cached.interval_secs = req.interval_secs;

            let created = existing.is_none();
            let epoch_changed = existing
                .as_ref()
                .is_some_and(|e| e.meta.epoch != cached.meta.epoch);
            let cached = cluster.put_resource(cached);
            (created, epoch_changed, cached)
        };

        if created || epoch_changed {
            if let Err(err) = self.storage.put_resource(&cached.meta) {
                // Losing the persisted copy would corrupt recovery.
                self.step_down(&format!("resource persistence failed: {err:#}"));
                return Err(WireError::internal(err));
            }
        }

        self.hot_write.write().unwrap().observe(&cached, &opts);
        self.hot_read.write().unwrap().observe(&cached, &opts);

        if created {
            self.watchers.notify(Event::ResourceCreated(cached.meta.clone()));
        } else if epoch_changed {
            self.watchers.notify(Event::ResourceChanged(cached.meta.clone()));
        }

        let step = self.controller.dispatch(&cached);
        Ok(ResourceHeartbeatRsp {
            resource_id,
            step,
            destroy_directly: false,
        })
    }

    fn assign_schedule_group(&self, meta: &mut ResourceMeta) {
        let group_rules = self.group_rules.read().unwrap();
        for rule in group_rules.iter() {
            if meta.labels.contains_key(&rule.group_by_label) {
                meta.group = rule.group_id;
                return;
            }
        }
    }

    fn ask_batch_split(
        &self,
        resource: ResourceMeta,
        count: u32,
    ) -> Result<ResponseBody, WireError> {
        if count == 0 {
            return Err(WireError::internal("split count must be positive"));
        }
        if self
            .cluster
            .read()
            .unwrap()
            .get_resource(resource.id)
            .is_none()
        {
            return Err(WireError::ShardNotFound);
        }
        let per_split = 1 + resource.peers.len() as u64;
        let first = self
            .storage
            .alloc_ids(u64::from(count) * per_split)
            .map_err(WireError::internal)?;
        let mut split_ids = Vec::with_capacity(count as usize);
        let mut next = first;
        for _ in 0..count {
            let new_resource_id = next;
            next += 1;
            let mut new_peer_ids = Vec::with_capacity(resource.peers.len());
            for _ in 0..resource.peers.len() {
                new_peer_ids.push(next);
                next += 1;
            }
            split_ids.push(SplitId { new_resource_id, new_peer_ids });
        }
        Ok(ResponseBody::AskBatchSplit { split_ids })
    }

    fn create_resources(
        &self,
        resources: Vec<ResourceMeta>,
        least_replicas: Vec<usize>,
    ) -> Result<ResponseBody, WireError> {
        let opts = self.options.snapshot();
        for (idx, mut meta) in resources.into_iter().enumerate() {
            if self.cluster.read().unwrap().get_resource(meta.id).is_some() {
                continue;
            }
            if meta.peers.is_empty() {
                let floor = least_replicas.get(idx).copied().unwrap_or(0);
                meta.peers = self.allocate_peers(&meta, opts.max_replicas, floor)?;
            }
            self.storage
                .put_resource(&meta)
                .map_err(WireError::internal)?;
            let leader = meta.peers.first().copied();
            self.cluster
                .write()
                .unwrap()
                .put_resource(CachedResource::new(meta.clone(), leader));
            self.watchers.notify(Event::ResourceCreated(meta));
        }
        Ok(ResponseBody::Empty)
    }

    /// Spread new peers over healthy containers, quietest first. The full
    /// replica target may be relaxed down to `least` when the cluster is
    /// small.
    fn allocate_peers(
        &self,
        meta: &ResourceMeta,
        target: usize,
        least: usize,
    ) -> Result<Vec<Peer>, WireError> {
        let cluster = self.cluster.read().unwrap();
        let mut candidates: Vec<_> = cluster
            .get_containers()
            .into_iter()
            .filter(|c| c.is_up() && !c.is_disconnected())
            .collect();
        candidates.sort_by_key(|c| (c.resource_count(meta.group), c.id()));
        drop(cluster);

        // A zero floor means the full replica target is required.
        let required = if least == 0 { target } else { least };
        if candidates.len() < required {
            return Err(WireError::internal(format!(
                "resource {}: {} healthy containers, need at least {required}",
                meta.id,
                candidates.len()
            )));
        }
        let wanted = target.min(candidates.len());
        let mut peers = Vec::new();
        for container in candidates.into_iter().take(wanted) {
            let peer_id = self.storage.alloc_ids(1).map_err(WireError::internal)?;
            peers.push(Peer {
                id: peer_id,
                container_id: container.id(),
                role: PeerRole::Voter,
            });
        }
        Ok(peers)
    }

    fn remove_resources(&self, ids: Vec<ResourceId>) -> Result<ResponseBody, WireError> {
        for id in ids {
            let removed = self.cluster.write().unwrap().remove_resource(id);
            self.storage
                .remove_resource(id)
                .map_err(WireError::internal)?;
            self.controller.cancel(id, crate::schedule::CancelReason::Admin);
            self.watchers.notify(Event::ResourceDestroyed(id));

            // Nudge the shard leader directly when its container keeps a
            // registered session.
            if let Some(res) = removed {
                if let Some(leader_container) = res.leader_container() {
                    let sessions = self.sessions.lock().unwrap();
                    if let Some(out) = sessions.get(&leader_container) {
                        let _ = out.send(Response::ok(
                            0,
                            ResponseBody::ResourceHeartbeat(ResourceHeartbeatRsp {
                                resource_id: id,
                                step: None,
                                destroy_directly: true,
                            }),
                        ));
                    }
                }
            }
        }
        Ok(ResponseBody::Empty)
    }

    fn check_resource_state(&self, ids: Vec<ResourceId>) -> Result<ResponseBody, WireError> {
        let mut destroying = Vec::new();
        let mut destroyed = Vec::new();
        for id in ids {
            match self.storage.get_destroying(id).map_err(WireError::internal)? {
                Some(status) if status.state == ResourceState::Destroyed => destroyed.push(id),
                Some(_) => destroying.push(id),
                None => {}
            }
        }
        Ok(ResponseBody::CheckResourceState { destroying, destroyed })
    }

    fn put_placement_rule(&self, rule: crate::placement::Rule) -> Result<ResponseBody, WireError> {
        self.rules.set_rule(rule.clone()).map_err(WireError::internal)?;
        self.storage.put_rule(&rule).map_err(WireError::internal)?;
        Ok(ResponseBody::Empty)
    }

    fn get_applied_rules(&self, resource_id: ResourceId) -> Result<ResponseBody, WireError> {
        let Some(res) = self.cluster.read().unwrap().get_resource(resource_id) else {
            return Err(WireError::ShardNotFound);
        };
        Ok(ResponseBody::GetAppliedRules {
            rules: self.rules.rules_for(&res.meta),
        })
    }

    fn add_schedule_group_rule(&self, rule: ScheduleGroupRule) -> Result<ResponseBody, WireError> {
        self.storage.put_group_rule(&rule).map_err(WireError::internal)?;
        let mut group_rules = self.group_rules.write().unwrap();
        group_rules.retain(|r| !(r.group_id == rule.group_id && r.name == rule.name));
        group_rules.push(rule);
        Ok(ResponseBody::Empty)
    }

    fn create_job(&self, job: Job) -> Result<ResponseBody, WireError> {
        if self.storage.get_job(job.id).map_err(WireError::internal)?.is_some() {
            return Ok(ResponseBody::Empty);
        }
        self.storage.put_job(&job).map_err(WireError::internal)?;
        Ok(ResponseBody::Empty)
    }

    fn remove_job(&self, mut job: Job) -> Result<ResponseBody, WireError> {
        job.state = JobState::Removing;
        self.storage.put_job(&job).map_err(WireError::internal)?;
        self.storage.remove_job(job.id).map_err(WireError::internal)?;
        Ok(ResponseBody::Empty)
    }

    fn create_destroying(
        &self,
        id: ResourceId,
        index: u64,
        remove_data: bool,
        replicas: Vec<u64>,
    ) -> Result<ResponseBody, WireError> {
        if let Some(status) = self.storage.get_destroying(id).map_err(WireError::internal)? {
            return Ok(ResponseBody::DestroyingState { state: status.state });
        }
        let status = DestroyingStatus {
            state: ResourceState::Destroying,
            index,
            remove_data,
            replicas: replicas.into_iter().map(|id| (id, false)).collect(),
        };
        self.storage
            .put_destroying(id, &status)
            .map_err(WireError::internal)?;
        tracing::info!(resource = id, index, remove_data, "two-phase destroy started");
        Ok(ResponseBody::DestroyingState { state: status.state })
    }

    fn report_destroyed(
        &self,
        id: ResourceId,
        replica_id: u64,
    ) -> Result<ResponseBody, WireError> {
        let Some(mut status) = self.storage.get_destroying(id).map_err(WireError::internal)?
        else {
            return Err(WireError::ShardNotFound);
        };
        if status.state == ResourceState::Destroyed {
            return Ok(ResponseBody::DestroyingState { state: status.state });
        }
        if let Some(reported) = status.replicas.get_mut(&replica_id) {
            *reported = true;
        }
        if status.all_reported() {
            status.state = ResourceState::Destroyed;
            self.cluster.write().unwrap().remove_resource(id);
            self.storage.remove_resource(id).map_err(WireError::internal)?;
            self.watchers.notify(Event::ResourceDestroyed(id));
            tracing::info!(resource = id, "two-phase destroy completed");
        }
        self.storage
            .put_destroying(id, &status)
            .map_err(WireError::internal)?;
        Ok(ResponseBody::DestroyingState { state: status.state })
    }
}

/// Watch the election and (re)load the cache on every term this node wins.
pub fn spawn_leader_watch(state: Arc<CoordState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut leader_rx = state.election.subscribe();
        let me = state.election.member().id;
        loop {
            if leader_rx.changed().await.is_err() {
                return;
            }
            let leads = leader_rx.borrow_and_update().as_ref().map(|m| m.id) == Some(me);
            if leads {
                if let Err(err) = state.load_cluster() {
                    state.step_down(&format!("cluster load failed: {err:#}"));
                }
            }
        }
    })
}

/// Periodic statistics roll-up: decay loads of silent containers and log a
/// cluster summary.
pub fn spawn_stats_loop(state: Arc<CoordState>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !state.is_leader() {
                continue;
            }
            let opts = state.options.snapshot();
            let containers = state.cluster.read().unwrap().get_containers();
            {
                let mut stats = state.stats.write().unwrap();
                for container in &containers {
                    if container.is_disconnected() {
                        stats.decay(container.id());
                    }
                    if container.is_tombstone() {
                        stats.remove(container.id());
                    }
                }
            }
            let groups: Vec<u64> = {
                let cluster = state.cluster.read().unwrap();
                let mut groups: Vec<u64> = cluster
                    .get_resources()
                    .iter()
                    .map(|r| r.meta.group)
                    .collect();
                groups.sort_unstable();
                groups.dedup();
                groups
            };
            let summary = collect_summary(&containers, &opts, &groups);
            tracing::info!(
                up = summary.up,
                disconnected = summary.disconnected,
                down = summary.down,
                offline = summary.offline,
                tombstone = summary.tombstone,
                low_space = summary.low_space,
                resources = summary.resource_count,
                leaders = summary.leader_count,
                storage_used = summary.storage_size,
                storage_capacity = summary.storage_capacity,
                "cluster status"
            );
        }
    })
}
