//! Candidate filters shared by the schedulers.

use crate::cluster::{CachedContainer, CachedResource};
use crate::config::{ScheduleOptions, REJECT_LEADER, SPECIAL_USE_HOT, SPECIAL_USE_RESERVED};

/// Basic liveness gate for any scheduling decision.
pub fn container_online(container: &CachedContainer) -> bool {
    container.is_up() && !container.is_disconnected()
}

/// May the container receive leadership right now.
pub fn can_receive_leader(container: &CachedContainer, opts: &ScheduleOptions) -> bool {
    container_online(container)
        && !container.is_unhealthy(opts)
        && !container.paused_leader_transfer
        && !opts.property_matches(REJECT_LEADER, &container.meta.labels)
}

/// May the container give up leadership through a scheduler.
pub fn can_yield_leader(container: &CachedContainer) -> bool {
    !container.paused_leader_transfer
}

/// May the container receive a new replica (snapshot load, space, pending
/// backlog all considered).
pub fn can_receive_peer(container: &CachedContainer, opts: &ScheduleOptions) -> bool {
    container_online(container)
        && !container.is_unhealthy(opts)
        && !container.is_low_space(opts)
        && container.total_pending_peers() < opts.max_pending_peer_count
}

/// Target filter for ordinary balance scheduling: special-use containers
/// take no regular traffic.
pub fn balance_target_ok(container: &CachedContainer, opts: &ScheduleOptions) -> bool {
    can_receive_peer(container, opts) && container.special_use().is_none()
}

/// Target filter for hot-resource scheduling: hot-dedicated containers are
/// fair game, reserved ones never are.
pub fn hot_target_ok(container: &CachedContainer, opts: &ScheduleOptions) -> bool {
    can_receive_peer(container, opts)
        && match container.special_use() {
            None => true,
            Some(SPECIAL_USE_HOT) => true,
            Some(SPECIAL_USE_RESERVED) => false,
            Some(_) => false,
        }
}

/// A resource healthy enough to be moved around.
pub fn resource_movable(res: &CachedResource) -> bool {
    res.is_healthy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelMatch;
    use crate::meta::{ContainerMeta, ContainerState};
    use std::collections::BTreeMap;
    use std::time::Instant;

    fn container(labels: &[(&str, &str)]) -> CachedContainer {
        let mut c = CachedContainer::new(ContainerMeta {
            id: 1,
            addr: "127.0.0.1:20001".into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            state: ContainerState::Up,
            start_time: 0,
        });
        c.last_heartbeat = Some(Instant::now());
        c
    }

    #[test]
    fn reject_leader_label_blocks_leadership() {
        let mut opts = ScheduleOptions::default();
        opts.label_properties.insert(
            REJECT_LEADER.to_string(),
            vec![LabelMatch { key: "noleader".into(), value: "true".into() }],
        );
        assert!(can_receive_leader(&container(&[]), &opts));
        assert!(!can_receive_leader(&container(&[("noleader", "true")]), &opts));
    }

    #[test]
    fn special_use_split_between_balance_and_hot() {
        let opts = ScheduleOptions::default();
        let plain = container(&[]);
        let hot = container(&[("specialUse", "hotResource")]);
        let reserved = container(&[("specialUse", "reserved")]);

        assert!(balance_target_ok(&plain, &opts));
        assert!(!balance_target_ok(&hot, &opts));
        assert!(!balance_target_ok(&reserved, &opts));

        assert!(hot_target_ok(&plain, &opts));
        assert!(hot_target_ok(&hot, &opts));
        assert!(!hot_target_ok(&reserved, &opts));
    }

    #[test]
    fn pending_peer_backlog_blocks_new_replicas() {
        let mut opts = ScheduleOptions::default();
        opts.max_pending_peer_count = 2;
        let mut c = container(&[]);
        c.pending_peer_counts.insert(0, 2);
        assert!(!can_receive_peer(&c, &opts));
    }
}
