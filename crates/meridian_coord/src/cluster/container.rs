//! Cached view of one container.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{ScheduleOptions, SPECIAL_USE_LABEL};
use crate::meta::{ContainerMeta, ContainerState, ContainerStats, GroupId};
use crate::statistics::CONTAINER_HEARTBEAT_INTERVAL;

/// Immutable snapshot of a container plus derived counters.
///
/// Updates never mutate in place: the cluster cache clones, adjusts and
/// installs a fresh record, so concurrent readers keep a consistent view.
#[derive(Debug, Clone)]
pub struct CachedContainer {
    pub meta: ContainerMeta,
    pub stats: ContainerStats,
    pub leader_counts: HashMap<GroupId, u64>,
    pub resource_counts: HashMap<GroupId, u64>,
    pub leader_sizes: HashMap<GroupId, u64>,
    pub resource_sizes: HashMap<GroupId, u64>,
    pub pending_peer_counts: HashMap<GroupId, u64>,
    pub last_heartbeat: Option<Instant>,
    /// Set while an admin scheduler (evict-leader) owns leader placement.
    pub paused_leader_transfer: bool,
}

impl CachedContainer {
    pub fn new(meta: ContainerMeta) -> Self {
        Self {
            meta,
            stats: ContainerStats::default(),
            leader_counts: HashMap::new(),
            resource_counts: HashMap::new(),
            leader_sizes: HashMap::new(),
            resource_sizes: HashMap::new(),
            pending_peer_counts: HashMap::new(),
            last_heartbeat: None,
            paused_leader_transfer: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn is_up(&self) -> bool {
        self.meta.state == ContainerState::Up
    }

    pub fn is_tombstone(&self) -> bool {
        self.meta.state == ContainerState::Tombstone
    }

    pub fn down_time(&self) -> Duration {
        self.last_heartbeat
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX)
    }

    /// No heartbeat for two report intervals.
    pub fn is_disconnected(&self) -> bool {
        self.down_time() >= CONTAINER_HEARTBEAT_INTERVAL * 2
    }

    pub fn is_down(&self, opts: &ScheduleOptions) -> bool {
        self.down_time() >= opts.max_container_down_time
    }

    pub fn is_unhealthy(&self, opts: &ScheduleOptions) -> bool {
        self.stats.is_busy
            || self.stats.sending_snap_count > opts.max_snapshot_count
            || self.stats.receiving_snap_count > opts.max_snapshot_count
    }

    pub fn is_low_space(&self, opts: &ScheduleOptions) -> bool {
        if self.stats.capacity == 0 {
            return false;
        }
        let used_ratio = self.stats.used_size as f64 / self.stats.capacity as f64;
        used_ratio >= opts.low_space_ratio
    }

    pub fn special_use(&self) -> Option<&str> {
        self.meta.label(SPECIAL_USE_LABEL)
    }

    pub fn leader_count(&self, group: GroupId) -> u64 {
        self.leader_counts.get(&group).copied().unwrap_or(0)
    }

    pub fn resource_count(&self, group: GroupId) -> u64 {
        self.resource_counts.get(&group).copied().unwrap_or(0)
    }

    pub fn leader_size(&self, group: GroupId) -> u64 {
        self.leader_sizes.get(&group).copied().unwrap_or(0)
    }

    pub fn resource_size(&self, group: GroupId) -> u64 {
        self.resource_sizes.get(&group).copied().unwrap_or(0)
    }

    pub fn pending_peer_count(&self, group: GroupId) -> u64 {
        self.pending_peer_counts.get(&group).copied().unwrap_or(0)
    }

    pub fn total_pending_peers(&self) -> u64 {
        self.pending_peer_counts.values().sum()
    }

    /// Balance score for leadership within one group.
    pub fn leader_score(&self, group: GroupId) -> f64 {
        self.leader_count(group) as f64
    }

    /// Balance score for peer placement within one group. The count is the
    /// base; once the disk crosses the high-space watermark the score grows
    /// with the fill ratio so full containers shed peers first.
    pub fn resource_score(&self, group: GroupId, opts: &ScheduleOptions) -> f64 {
        let base = self.resource_count(group) as f64;
        if self.stats.capacity == 0 {
            return base;
        }
        let used_ratio = self.stats.used_size as f64 / self.stats.capacity as f64;
        if used_ratio < opts.high_space_ratio {
            return base;
        }
        let span = (opts.low_space_ratio - opts.high_space_ratio).max(f64::EPSILON);
        let pressure = ((used_ratio - opts.high_space_ratio) / span).min(1.0);
        base * (1.0 + pressure * 10.0)
    }
}
