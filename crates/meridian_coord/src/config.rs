//! Scheduling configuration.
//!
//! Options are read far more often than they change, so readers take an
//! immutable snapshot (`Arc`) that stays coherent for the duration of a
//! scheduler tick; updates swap the whole snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Label property key that bars containers from holding leaders.
pub const REJECT_LEADER: &str = "reject-leader";

/// Container label that dedicates a node to a special purpose.
pub const SPECIAL_USE_LABEL: &str = "specialUse";
pub const SPECIAL_USE_HOT: &str = "hotResource";
pub const SPECIAL_USE_RESERVED: &str = "reserved";

/// One `key=value` match used by label properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMatch {
    pub key: String,
    pub value: String,
}

/// All tunables the schedulers and checkers read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleOptions {
    pub leader_schedule_limit: u64,
    pub resource_schedule_limit: u64,
    pub hot_resource_schedule_limit: u64,
    pub merge_schedule_limit: u64,
    pub replica_schedule_limit: u64,
    pub max_replicas: usize,
    pub high_space_ratio: f64,
    pub low_space_ratio: f64,
    pub tolerant_size_ratio: f64,
    pub max_container_down_time: Duration,
    pub max_snapshot_count: u64,
    pub max_pending_peer_count: u64,
    pub max_zombie_rounds: u32,
    /// Consecutive qualifying reports before a resource counts as hot.
    pub hot_cache_hits_threshold: u32,
    /// Topology label keys, most significant first.
    pub location_labels: Vec<String>,
    /// Property name -> container label matches, e.g. `reject-leader`.
    pub label_properties: BTreeMap<String, Vec<LabelMatch>>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            leader_schedule_limit: 4,
            resource_schedule_limit: 2048,
            hot_resource_schedule_limit: 4,
            merge_schedule_limit: 8,
            replica_schedule_limit: 64,
            max_replicas: 3,
            high_space_ratio: 0.7,
            low_space_ratio: 0.8,
            tolerant_size_ratio: 5.0,
            max_container_down_time: Duration::from_secs(30 * 60),
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            max_zombie_rounds: 3,
            hot_cache_hits_threshold: 3,
            location_labels: Vec::new(),
            label_properties: BTreeMap::new(),
        }
    }
}

impl ScheduleOptions {
    /// Whether a container's labels match the given property.
    pub fn property_matches(&self, property: &str, labels: &BTreeMap<String, String>) -> bool {
        self.label_properties
            .get(property)
            .map(|matches| {
                matches
                    .iter()
                    .any(|m| labels.get(&m.key).is_some_and(|v| *v == m.value))
            })
            .unwrap_or(false)
    }
}

/// Snapshot-swapped options handle shared across the coordinator.
#[derive(Clone, Default)]
pub struct SharedOptions {
    inner: Arc<RwLock<Arc<ScheduleOptions>>>,
}

impl SharedOptions {
    pub fn new(opts: ScheduleOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(opts))),
        }
    }

    /// A coherent snapshot; hold it for the whole tick.
    pub fn snapshot(&self) -> Arc<ScheduleOptions> {
        self.inner.read().unwrap().clone()
    }

    /// Apply a mutation as a whole-snapshot swap.
    pub fn update(&self, mutate: impl FnOnce(&mut ScheduleOptions)) {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_isolated_from_updates() {
        let shared = SharedOptions::new(ScheduleOptions::default());
        let before = shared.snapshot();
        shared.update(|o| o.leader_schedule_limit = 99);
        assert_eq!(before.leader_schedule_limit, 4);
        assert_eq!(shared.snapshot().leader_schedule_limit, 99);
    }

    #[test]
    fn reject_leader_property_matches_labels() {
        let shared = SharedOptions::new(ScheduleOptions::default());
        shared.update(|o| {
            o.label_properties.insert(
                REJECT_LEADER.to_string(),
                vec![LabelMatch {
                    key: "noleader".to_string(),
                    value: "true".to_string(),
                }],
            );
        });
        let opts = shared.snapshot();
        let mut labels = BTreeMap::new();
        assert!(!opts.property_matches(REJECT_LEADER, &labels));
        labels.insert("noleader".to_string(), "true".to_string());
        assert!(opts.property_matches(REJECT_LEADER, &labels));
    }
}
