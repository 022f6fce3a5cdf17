//! Flow statistics and hot-spot detection.
//!
//! Containers report absolute counters over an interval; rates are smoothed
//! through a median-of-samples window, with the raw last sample kept as the
//! instant view. Resources qualify as hot after enough consecutive reports
//! above the byte/key rate thresholds, and a hot entry survives a bounded
//! number of missed reports before eviction.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::cluster::{CachedContainer, CachedResource};
use crate::config::ScheduleOptions;
use crate::meta::{ContainerId, ContainerStats, GroupId, ResourceId};

/// External heartbeat contract with storage nodes.
pub const CONTAINER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const RESOURCE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Default hot thresholds.
pub const MIN_HOT_BYTE_RATE: f64 = 100.0;
pub const MIN_HOT_KEY_RATE: f64 = 10.0;

/// Rolling window size for container load smoothing.
const ROLLING_WINDOW: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerLoadKind {
    WriteBytes,
    WriteKeys,
    ReadBytes,
    ReadKeys,
}

const LOAD_KINDS: [ContainerLoadKind; 4] = [
    ContainerLoadKind::WriteBytes,
    ContainerLoadKind::WriteKeys,
    ContainerLoadKind::ReadBytes,
    ContainerLoadKind::ReadKeys,
];

/// Median-of-samples smoother.
#[derive(Debug, Clone, Default)]
struct MedianFilter {
    samples: VecDeque<f64>,
}

impl MedianFilter {
    fn add(&mut self, sample: f64) {
        if self.samples.len() == ROLLING_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn median(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}

/// Rolling and instant load views for one container.
#[derive(Debug, Clone, Default)]
pub struct RollingContainerStats {
    rolling: HashMap<ContainerLoadKind, MedianFilter>,
    instant: HashMap<ContainerLoadKind, f64>,
}

impl RollingContainerStats {
    fn observe(&mut self, stats: &ContainerStats) {
        let secs = stats
            .interval_end
            .saturating_sub(stats.interval_start)
            .max(1) as f64;
        for kind in LOAD_KINDS {
            let total = match kind {
                ContainerLoadKind::WriteBytes => stats.written_bytes,
                ContainerLoadKind::WriteKeys => stats.written_keys,
                ContainerLoadKind::ReadBytes => stats.read_bytes,
                ContainerLoadKind::ReadKeys => stats.read_keys,
            };
            let rate = total as f64 / secs;
            self.rolling.entry(kind).or_default().add(rate);
            self.instant.insert(kind, rate);
        }
    }

    /// Halve every sampled rate, applied when heartbeats go missing.
    fn decay(&mut self) {
        for filter in self.rolling.values_mut() {
            for sample in filter.samples.iter_mut() {
                *sample /= 2.0;
            }
        }
        for value in self.instant.values_mut() {
            *value /= 2.0;
        }
    }

    pub fn load(&self, kind: ContainerLoadKind) -> f64 {
        self.rolling.get(&kind).map(MedianFilter::median).unwrap_or(0.0)
    }

    pub fn instant_load(&self, kind: ContainerLoadKind) -> f64 {
        self.instant.get(&kind).copied().unwrap_or(0.0)
    }
}

/// Per-container rolling statistics for the whole cluster.
#[derive(Debug, Default)]
pub struct ContainersStats {
    rolling: HashMap<ContainerId, RollingContainerStats>,
}

impl ContainersStats {
    pub fn observe(&mut self, stats: &ContainerStats) {
        self.rolling
            .entry(stats.container_id)
            .or_default()
            .observe(stats);
    }

    pub fn decay(&mut self, container_id: ContainerId) {
        if let Some(stats) = self.rolling.get_mut(&container_id) {
            stats.decay();
        }
    }

    pub fn remove(&mut self, container_id: ContainerId) {
        self.rolling.remove(&container_id);
    }

    pub fn get(&self, container_id: ContainerId) -> Option<&RollingContainerStats> {
        self.rolling.get(&container_id)
    }

    pub fn load(&self, container_id: ContainerId, kind: ContainerLoadKind) -> f64 {
        self.get(container_id).map(|s| s.load(kind)).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Read,
    Write,
}

/// One resource's standing in the hot cache.
#[derive(Debug, Clone)]
pub struct HotPeerStat {
    pub resource_id: ResourceId,
    pub group: GroupId,
    pub leader_container: Option<ContainerId>,
    pub kind: FlowKind,
    pub byte_rate: f64,
    pub key_rate: f64,
    /// Consecutive qualifying reports.
    pub hot_degree: u32,
    /// Missed/below-threshold rounds left before eviction.
    anti_count: u32,
}

/// Hot-resource index for one flow direction, keyed by group for fast
/// scheduler access.
#[derive(Debug)]
pub struct HotPeerCache {
    kind: FlowKind,
    groups: HashMap<GroupId, HashMap<ResourceId, HotPeerStat>>,
}

impl HotPeerCache {
    pub fn new(kind: FlowKind) -> Self {
        Self {
            kind,
            groups: HashMap::new(),
        }
    }

    /// Fold one accepted resource heartbeat into the cache.
    pub fn observe(&mut self, res: &CachedResource, opts: &ScheduleOptions) {
        let (byte_rate, key_rate) = match self.kind {
            FlowKind::Write => (res.write_rate_bytes(), res.write_rate_keys()),
            FlowKind::Read => (res.read_rate_bytes(), res.read_rate_keys()),
        };
        let qualifies = byte_rate >= MIN_HOT_BYTE_RATE || key_rate >= MIN_HOT_KEY_RATE;
        let entries = self.groups.entry(res.meta.group).or_default();
        let mut evict = false;
        match entries.get_mut(&res.id()) {
            Some(stat) => {
                stat.byte_rate = byte_rate;
                stat.key_rate = key_rate;
                stat.leader_container = res.leader_container();
                if qualifies {
                    stat.hot_degree += 1;
                    stat.anti_count = opts.max_zombie_rounds;
                } else {
                    stat.hot_degree = stat.hot_degree.saturating_sub(1);
                    if stat.anti_count == 0 {
                        evict = true;
                    } else {
                        stat.anti_count -= 1;
                    }
                }
            }
            None if qualifies => {
                entries.insert(
                    res.id(),
                    HotPeerStat {
                        resource_id: res.id(),
                        group: res.meta.group,
                        leader_container: res.leader_container(),
                        kind: self.kind,
                        byte_rate,
                        key_rate,
                        hot_degree: 1,
                        anti_count: opts.max_zombie_rounds,
                    },
                );
            }
            None => {}
        }
        if evict {
            entries.remove(&res.id());
        }
    }

    pub fn forget(&mut self, group: GroupId, resource_id: ResourceId) {
        if let Some(entries) = self.groups.get_mut(&group) {
            entries.remove(&resource_id);
        }
    }

    pub fn is_hot(&self, group: GroupId, resource_id: ResourceId, opts: &ScheduleOptions) -> bool {
        self.groups
            .get(&group)
            .and_then(|entries| entries.get(&resource_id))
            .is_some_and(|stat| stat.hot_degree >= opts.hot_cache_hits_threshold)
    }

    /// Hot entries in a group, hottest byte rate first.
    pub fn hot_peers(&self, group: GroupId, opts: &ScheduleOptions) -> Vec<HotPeerStat> {
        let mut out: Vec<HotPeerStat> = self
            .groups
            .get(&group)
            .into_iter()
            .flat_map(|entries| entries.values())
            .filter(|stat| stat.hot_degree >= opts.hot_cache_hits_threshold)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.byte_rate.total_cmp(&a.byte_rate).then(a.resource_id.cmp(&b.resource_id)));
        out
    }
}

/// Cluster-wide container state roll-up, collected from the cache and logged
/// by the coordinator's stats tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterSummary {
    pub up: u64,
    pub disconnected: u64,
    pub unhealthy: u64,
    pub down: u64,
    pub offline: u64,
    pub tombstone: u64,
    pub low_space: u64,
    pub storage_size: u64,
    pub storage_capacity: u64,
    pub resource_count: u64,
    pub leader_count: u64,
    /// `label:value` occurrence counts over the location labels.
    pub label_counter: BTreeMap<String, u64>,
}

pub fn collect_summary(
    containers: &[std::sync::Arc<CachedContainer>],
    opts: &ScheduleOptions,
    groups: &[GroupId],
) -> ClusterSummary {
    let mut summary = ClusterSummary::default();
    for container in containers {
        for key in &opts.location_labels {
            let value = container.meta.label(key).unwrap_or("unknown");
            if !container.is_tombstone() {
                *summary
                    .label_counter
                    .entry(format!("{key}:{value}"))
                    .or_default() += 1;
            }
        }
        match container.meta.state {
            crate::meta::ContainerState::Up => {
                if container.is_down(opts) {
                    summary.down += 1;
                } else if container.is_unhealthy(opts) {
                    summary.unhealthy += 1;
                } else if container.is_disconnected() {
                    summary.disconnected += 1;
                } else {
                    summary.up += 1;
                }
            }
            crate::meta::ContainerState::Offline => summary.offline += 1,
            crate::meta::ContainerState::Tombstone => {
                summary.tombstone += 1;
                continue;
            }
        }
        if container.is_low_space(opts) {
            summary.low_space += 1;
        }
        summary.storage_size += container.stats.used_size;
        summary.storage_capacity += container.stats.capacity;
        for group in groups {
            summary.resource_count += container.resource_count(*group);
            summary.leader_count += container.leader_count(*group);
        }
    }
    summary
}
