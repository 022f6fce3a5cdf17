//! Operator constructors shared by schedulers and checkers.

use anyhow::bail;

use crate::cluster::CachedResource;
use crate::meta::{ContainerId, PeerId, PeerRole};

use super::operator::{OpKind, OpStep, Operator, PeerSpec};

/// Transfer leadership of `res` to a peer on `to`.
pub fn transfer_leader(
    desc: &str,
    res: &CachedResource,
    to: ContainerId,
    kind: OpKind,
) -> anyhow::Result<Operator> {
    let Some(from) = res.leader_container() else {
        bail!("resource {} has no leader to transfer", res.id());
    };
    if from == to {
        bail!("resource {} leader is already on container {to}", res.id());
    }
    let Some(target) = res.container_peer(to) else {
        bail!("resource {} has no peer on container {to}", res.id());
    };
    if target.role == PeerRole::Learner {
        bail!("cannot transfer leader of resource {} to a learner", res.id());
    }
    Ok(Operator::new(
        format!("{desc}: transfer leader {from} -> {to}"),
        res.id(),
        res.meta.epoch,
        kind | OpKind::LEADER,
        vec![OpStep::TransferLeader { from, to }],
    ))
}

/// Move the peer of `res` on `from` to `to`: add a learner, promote it, step
/// leadership aside if needed, then drop the old peer.
pub fn move_peer(
    desc: &str,
    res: &CachedResource,
    from: ContainerId,
    to: ContainerId,
    new_peer_id: PeerId,
    kind: OpKind,
) -> anyhow::Result<Operator> {
    let Some(old) = res.container_peer(from) else {
        bail!("resource {} has no peer on container {from}", res.id());
    };
    if res.container_peer(to).is_some() {
        bail!("resource {} already has a peer on container {to}", res.id());
    }
    let mut steps = vec![
        OpStep::AddLearner { container_id: to, peer_id: new_peer_id },
        OpStep::PromoteLearner { container_id: to, peer_id: new_peer_id },
    ];
    if res.leader_container() == Some(from) {
        steps.push(OpStep::TransferLeader { from, to });
    }
    steps.push(OpStep::RemovePeer { container_id: from, peer_id: old.id });
    Ok(Operator::new(
        format!("{desc}: move peer {from} -> {to}"),
        res.id(),
        res.meta.epoch,
        kind | OpKind::RESOURCE,
        steps,
    ))
}

/// Move a learner of `res` from `from` to `to` without a promotion.
pub fn move_learner(
    desc: &str,
    res: &CachedResource,
    from: ContainerId,
    to: ContainerId,
    new_peer_id: PeerId,
    kind: OpKind,
) -> anyhow::Result<Operator> {
    let Some(old) = res.container_peer(from) else {
        bail!("resource {} has no peer on container {from}", res.id());
    };
    if old.role != PeerRole::Learner {
        bail!("peer {} on container {from} is not a learner", old.id);
    }
    if res.container_peer(to).is_some() {
        bail!("resource {} already has a peer on container {to}", res.id());
    }
    Ok(Operator::new(
        format!("{desc}: move learner {from} -> {to}"),
        res.id(),
        res.meta.epoch,
        kind | OpKind::RESOURCE,
        vec![
            OpStep::AddLearner { container_id: to, peer_id: new_peer_id },
            OpStep::RemovePeer { container_id: from, peer_id: old.id },
        ],
    ))
}

/// Swap voter sets through joint consensus: enter with the given promotions
/// and demotions, then leave.
pub fn joint_change(
    desc: &str,
    res: &CachedResource,
    promotes: Vec<PeerSpec>,
    demotes: Vec<PeerSpec>,
    kind: OpKind,
) -> anyhow::Result<Operator> {
    if promotes.is_empty() && demotes.is_empty() {
        bail!("joint change on resource {} has no role switches", res.id());
    }
    Ok(Operator::new(
        format!("{desc}: joint change on resource {}", res.id()),
        res.id(),
        res.meta.epoch,
        kind | OpKind::RESOURCE,
        vec![
            OpStep::ChangePeerV2Enter {
                promotes: promotes.clone(),
                demotes: demotes.clone(),
            },
            OpStep::ChangePeerV2Leave { promotes, demotes },
        ],
    ))
}
