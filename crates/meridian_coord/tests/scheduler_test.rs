//! Scheduler behavior against a fixed cluster cache.

mod common;

use common::{TestCluster, KB, MB};

use meridian_coord::config::{LabelMatch, REJECT_LEADER};
use meridian_coord::placement::{ConstraintOp, LabelConstraint, Rule, RuleRole};
use meridian_coord::schedule::schedulers::{
    BalanceLeaderScheduler, BalanceResourceScheduler, EvictLeaderScheduler, HotResourceScheduler,
    LabelScheduler, ReplicaCheckerScheduler, ShuffleLeaderScheduler, ShuffleResourceScheduler,
};
use meridian_coord::schedule::{OpKind, OpStep, Operator, Scheduler};
use meridian_coord::statistics::{FlowKind, RESOURCE_HEARTBEAT_INTERVAL};

fn assert_transfer_leader(op: &Operator, from: u64, to: Option<u64>) {
    match op.steps.as_slice() {
        [OpStep::TransferLeader { from: f, to: t }] => {
            assert_eq!(*f, from, "transfer source");
            if let Some(to) = to {
                assert_eq!(*t, to, "transfer target");
            }
        }
        other => panic!("expected a single TransferLeader step, got {other:?}"),
    }
}

fn assert_transfer_peer(op: &Operator, from: u64, to: u64) {
    assert!(
        matches!(op.steps.first(), Some(OpStep::AddLearner { container_id, .. }) if *container_id == to),
        "expected AddLearner on {to}, got {:?}",
        op.steps
    );
    assert!(
        matches!(op.steps.last(), Some(OpStep::RemovePeer { container_id, .. }) if *container_id == from),
        "expected RemovePeer on {from}, got {:?}",
        op.steps
    );
}

/// Four containers each lead one resource; four shuffles must produce four
/// admin leader operators.
#[test]
fn shuffle_leader_emits_admin_leader_operators() {
    let tc = TestCluster::new();
    for id in 1..=4 {
        tc.add_container(id);
    }
    tc.add_leader_resource(1, &[1, 2, 3, 4]);
    tc.add_leader_resource(2, &[2, 3, 4, 1]);
    tc.add_leader_resource(3, &[3, 4, 1, 2]);
    tc.add_leader_resource(4, &[4, 1, 2, 3]);

    let scheduler = ShuffleLeaderScheduler::new();
    for _ in 0..4 {
        let ops = scheduler.schedule(&tc.view);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::LEADER | OpKind::ADMIN);
    }
}

#[test]
fn shuffle_leader_on_empty_cluster_is_a_noop() {
    let tc = TestCluster::new();
    assert!(ShuffleLeaderScheduler::new().schedule(&tc.view).is_empty());
}

/// The label scheduler drains leadership off `reject-leader` containers,
/// avoiding disconnected containers and pending peers.
#[test]
fn reject_leader_label_moves_leadership() {
    let tc = TestCluster::new();
    tc.options().update(|o| {
        o.label_properties.insert(
            REJECT_LEADER.to_string(),
            vec![LabelMatch { key: "noleader".into(), value: "true".into() }],
        );
    });
    tc.add_labels_container(1, &[("noleader", "true")]);
    tc.add_container(2);
    tc.add_container(3);
    tc.add_leader_resource(1, &[1, 2, 3]);
    tc.add_leader_resource(2, &[2, 1, 3]);

    let label = LabelScheduler::new();
    let ops = label.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert_transfer_leader(&ops[0], 1, None);

    // Container 3 down: the only possible target is 2.
    tc.set_container_disconnected(3);
    let ops = label.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert_transfer_leader(&ops[0], 1, Some(2));

    // With 3 down and 1 rejecting leaders the balancer has nowhere to go.
    let balance = BalanceLeaderScheduler::new();
    assert!(balance.schedule(&tc.view).is_empty());

    // A pending peer on 3 rules it out as well.
    tc.set_container_up(3);
    tc.set_pending_peer(1, 3);
    let ops = label.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert_transfer_leader(&ops[0], 1, Some(2));
}

/// Draining a container moves its leaders to followers.
#[test]
fn evict_leader_transfers_away_from_configured_container() {
    let tc = TestCluster::new();
    for id in 1..=3 {
        tc.add_container(id);
    }
    tc.add_leader_resource(1, &[1, 2]);
    tc.add_leader_resource(2, &[2, 1]);
    tc.add_leader_resource(3, &[3, 1]);

    let scheduler = EvictLeaderScheduler::from_args(&["1".to_string()]).unwrap();
    assert!(scheduler.is_schedule_allowed(&tc.view));
    scheduler.prepare(&tc.view).unwrap();
    let ops = scheduler.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].resource_id, 1);
    assert_transfer_leader(&ops[0], 1, Some(2));
    scheduler.cleanup(&tc.view);
}

#[test]
fn evict_leader_requires_container_arguments() {
    assert!(EvictLeaderScheduler::from_args(&[]).is_err());
    assert!(EvictLeaderScheduler::from_args(&["not-a-number".to_string()]).is_err());
}

/// Five write-hot resources led by container 1; containers 4 and 5 carry
/// `specialUse` labels. The balancer must leave them alone; the hot-write
/// scheduler may use the hot-dedicated container but never the reserved one.
#[test]
fn hot_write_respects_special_use_labels() {
    let tc = TestCluster::new();
    for id in 1..=3 {
        tc.add_container(id);
    }
    tc.add_labels_container(4, &[("specialUse", "hotResource")]);
    tc.add_labels_container(5, &[("specialUse", "reserved")]);

    let interval = RESOURCE_HEARTBEAT_INTERVAL.as_secs();
    tc.update_storage_written_bytes(1, 60 * MB * 10);
    tc.update_storage_written_bytes(2, 6 * MB * 10);
    tc.update_storage_written_bytes(3, 6 * MB * 10);
    tc.update_storage_written_bytes(4, 0);
    tc.update_storage_written_bytes(5, 0);

    tc.add_leader_resource_with_write_info(1, 1, &[2, 3], 512 * KB * interval);
    tc.add_leader_resource_with_write_info(2, 1, &[2, 3], 512 * KB * interval);
    tc.add_leader_resource_with_write_info(3, 1, &[2, 3], 512 * KB * interval);
    tc.add_leader_resource_with_write_info(4, 2, &[1, 3], 512 * KB * interval);
    tc.add_leader_resource_with_write_info(5, 3, &[1, 2], 512 * KB * interval);

    // Balance-resource may not touch the special-use containers.
    let balance = BalanceResourceScheduler::new();
    assert!(balance.schedule(&tc.view).is_empty());

    // Hot-write moves a peer off container 1 onto the hot-dedicated 4.
    let hot = HotResourceScheduler::new(FlowKind::Write);
    let ops = hot.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert!(ops[0].kind.contains(OpKind::HOT_RESOURCE));
    assert_transfer_peer(&ops[0], 1, 4);
}

/// Without the labels, the same imbalance lets the balancer act.
#[test]
fn balance_resource_moves_toward_empty_container() {
    let tc = TestCluster::new();
    for id in 1..=4 {
        tc.add_container(id);
    }
    for id in 1..=5 {
        tc.add_leader_resource(id, &[1, 2, 3]);
    }

    let balance = BalanceResourceScheduler::new();
    let ops = balance.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert_transfer_peer(&ops[0], 1, 4);
}

/// Hot reads are relieved with a leader transfer to the coldest peer.
#[test]
fn hot_read_transfers_leadership_to_cold_peer() {
    let tc = TestCluster::new();
    for id in 1..=3 {
        tc.add_container(id);
    }
    let interval = RESOURCE_HEARTBEAT_INTERVAL.as_secs();
    tc.update_storage_read_bytes(1, 75 * MB);
    tc.update_storage_read_bytes(2, 45 * MB);
    tc.update_storage_read_bytes(3, 5 * MB);
    tc.add_leader_resource_with_read_info(1, 1, &[2, 3], 512 * KB * interval);

    let hot = HotResourceScheduler::new(FlowKind::Read);
    let ops = hot.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert_transfer_leader(&ops[0], 1, Some(3));
}

/// Role-restricted shuffling only touches peers of the configured role.
#[test]
fn shuffle_resource_honors_role_selection() {
    let tc = TestCluster::new();
    for id in 1..=4 {
        tc.add_container(id);
    }
    // Resource 1: voters on 1 and 2, learner on 3, container 4 free.
    tc.add_leader_resource(1, &[1, 2]);
    {
        let mut cluster = tc.view.cluster.write().unwrap();
        let existing = cluster.get_resource(1).unwrap();
        let mut next = (*existing).clone();
        next.meta.peers.push(meridian_coord::meta::Peer {
            id: 103,
            container_id: 3,
            role: meridian_coord::meta::PeerRole::Learner,
        });
        cluster.put_resource(next);
    }

    let learners_only = ShuffleResourceScheduler::new(vec!["learner".to_string()]);
    let ops = learners_only.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    // A learner move never promotes.
    assert!(
        !ops[0]
            .steps
            .iter()
            .any(|s| matches!(s, OpStep::PromoteLearner { .. })),
        "unexpected promote in {:?}",
        ops[0].steps
    );
    assert_transfer_peer(&ops[0], 3, 4);
}

/// The replica checker walks an under-replicated resource toward its fit:
/// add a learner, promote it once reported, then idle.
#[test]
fn replica_checker_converges_to_the_rule_fit() {
    let tc = TestCluster::new();
    for id in 1..=3 {
        tc.add_container(id);
    }
    tc.add_leader_resource(1, &[1, 2]);

    let checker = ReplicaCheckerScheduler::new();

    // Round one: the missing third replica starts as a learner.
    let ops = checker.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    let new_peer_id = match ops[0].steps.as_slice() {
        [OpStep::AddLearner { container_id: 3, peer_id }] => *peer_id,
        other => panic!("expected AddLearner on container 3, got {other:?}"),
    };

    // The container reports the learner in place.
    {
        let mut cluster = tc.view.cluster.write().unwrap();
        let existing = cluster.get_resource(1).unwrap();
        let mut next = (*existing).clone();
        next.meta.peers.push(meridian_coord::meta::Peer {
            id: new_peer_id,
            container_id: 3,
            role: meridian_coord::meta::PeerRole::Learner,
        });
        next.meta.epoch.conf_ver += 1;
        cluster.put_resource(next);
    }

    // Round two: the learner is promoted to satisfy the voter rule.
    let ops = checker.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert!(matches!(
        ops[0].steps.as_slice(),
        [OpStep::PromoteLearner { container_id: 3, .. }]
    ));

    // The promotion lands: nothing left to do.
    {
        let mut cluster = tc.view.cluster.write().unwrap();
        let existing = cluster.get_resource(1).unwrap();
        let mut next = (*existing).clone();
        next.meta.peers.last_mut().unwrap().role = meridian_coord::meta::PeerRole::Voter;
        next.meta.epoch.conf_ver += 1;
        cluster.put_resource(next);
    }
    assert!(checker.schedule(&tc.view).is_empty());
}

/// A dedicated leader placement rule confines balance-leader targets.
#[test]
fn balance_leader_respects_leader_placement_rules() {
    let tc = TestCluster::new();
    tc.add_labels_container(1, &[("host", "a")]);
    tc.add_labels_container(2, &[("host", "b")]);
    tc.add_labels_container(3, &[("host", "c")]);
    tc.add_leader_resource(1, &[1, 2, 3]);
    // Pile extra leaders onto container 1 so the skew is real.
    for id in 2..=16 {
        tc.add_leader_resource(id, &[1, 2, 3]);
    }

    let balance = BalanceLeaderScheduler::new();

    // Default voter rule: the move is allowed.
    assert_eq!(balance.schedule(&tc.view).len(), 1);

    // Only host a may lead: no target qualifies.
    tc.view
        .rules
        .set_rule(Rule {
            group_id: "meridian".into(),
            id: "default".into(),
            index: 1,
            start_key: vec![],
            end_key: vec![],
            role: RuleRole::Leader,
            count: 1,
            label_constraints: vec![LabelConstraint {
                key: "host".into(),
                op: ConstraintOp::In,
                values: vec!["a".into()],
            }],
            location_labels: vec!["host".into()],
            created_at: 0,
        })
        .unwrap();
    assert!(balance.schedule(&tc.view).is_empty());

    // Hosts a and b: container 2 becomes a legal target again.
    tc.view
        .rules
        .set_rule(Rule {
            group_id: "meridian".into(),
            id: "default".into(),
            index: 1,
            start_key: vec![],
            end_key: vec![],
            role: RuleRole::Leader,
            count: 1,
            label_constraints: vec![LabelConstraint {
                key: "host".into(),
                op: ConstraintOp::In,
                values: vec!["a".into(), "b".into()],
            }],
            location_labels: vec!["host".into()],
            created_at: 0,
        })
        .unwrap();
    let ops = balance.schedule(&tc.view);
    assert_eq!(ops.len(), 1);
    assert_transfer_leader(&ops[0], 1, Some(2));
}
