//! Scheduling operators and their steps.
//!
//! A step is a pure predicate bundle over an observed resource snapshot:
//! `conf_ver_changed` counts the membership bumps the step accounts for,
//! `is_finish` says whether the observed state already reflects it, and
//! `check_safety` rejects states the step must never be dispatched against.

use std::fmt;
use std::ops::BitOr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cluster::CachedResource;
use crate::meta::{ContainerId, Epoch, PeerId, PeerRole, ResourceId};

/// Operator kind bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpKind(pub u32);

impl OpKind {
    pub const NONE: OpKind = OpKind(0);
    pub const LEADER: OpKind = OpKind(1);
    pub const RESOURCE: OpKind = OpKind(1 << 1);
    pub const ADMIN: OpKind = OpKind(1 << 2);
    pub const HOT_RESOURCE: OpKind = OpKind(1 << 3);
    pub const MERGE: OpKind = OpKind(1 << 4);
    pub const REPLICA: OpKind = OpKind(1 << 5);

    pub fn contains(self, other: OpKind) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpKind {
    type Output = OpKind;
    fn bitor(self, rhs: OpKind) -> OpKind {
        OpKind(self.0 | rhs.0)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (OpKind::LEADER, "leader"),
            (OpKind::RESOURCE, "resource"),
            (OpKind::ADMIN, "admin"),
            (OpKind::HOT_RESOURCE, "hot-resource"),
            (OpKind::MERGE, "merge"),
            (OpKind::REPLICA, "replica"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Target of one promote/demote inside a joint change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub peer_id: PeerId,
    pub container_id: ContainerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpStep {
    TransferLeader {
        from: ContainerId,
        to: ContainerId,
    },
    AddLearner {
        container_id: ContainerId,
        peer_id: PeerId,
    },
    PromoteLearner {
        container_id: ContainerId,
        peer_id: PeerId,
    },
    RemovePeer {
        container_id: ContainerId,
        peer_id: PeerId,
    },
    DemoteVoter {
        container_id: ContainerId,
        peer_id: PeerId,
    },
    ChangePeerV2Enter {
        promotes: Vec<PeerSpec>,
        demotes: Vec<PeerSpec>,
    },
    ChangePeerV2Leave {
        promotes: Vec<PeerSpec>,
        demotes: Vec<PeerSpec>,
    },
    SplitResource {
        start_version: u64,
    },
    MergeResource {
        to_resource: ResourceId,
        start_version: u64,
    },
}

/// Joint-change progress of one peer spec.
enum JointProgress {
    NotYet,
    Done,
}

fn joint_progress(
    res: &CachedResource,
    spec: &PeerSpec,
    before: PeerRole,
    after: PeerRole,
) -> anyhow::Result<JointProgress> {
    let Some(peer) = res.container_peer(spec.container_id) else {
        anyhow::bail!("peer {} not found on container {}", spec.peer_id, spec.container_id);
    };
    if peer.id != spec.peer_id {
        anyhow::bail!(
            "peer on container {} is {}, expected {}",
            spec.container_id,
            peer.id,
            spec.peer_id
        );
    }
    if peer.role == before {
        Ok(JointProgress::NotYet)
    } else if peer.role == after {
        Ok(JointProgress::Done)
    } else {
        anyhow::bail!(
            "peer {} on container {} has unexpected role {:?}",
            peer.id,
            spec.container_id,
            peer.role
        )
    }
}

/// Evaluate a whole joint change: all specs must be in the same phase and
/// every matched spec contributes one conf-ver bump only when all matched.
fn joint_state(
    res: &CachedResource,
    promotes: &[PeerSpec],
    demotes: &[PeerSpec],
    promote_before: PeerRole,
    promote_after: PeerRole,
    demote_before: PeerRole,
    demote_after: PeerRole,
) -> anyhow::Result<bool> {
    let mut done = 0usize;
    let total = promotes.len() + demotes.len();
    for spec in promotes {
        if matches!(
            joint_progress(res, spec, promote_before, promote_after)?,
            JointProgress::Done
        ) {
            done += 1;
        }
    }
    for spec in demotes {
        if matches!(
            joint_progress(res, spec, demote_before, demote_after)?,
            JointProgress::Done
        ) {
            done += 1;
        }
    }
    if done != 0 && done != total {
        anyhow::bail!("joint change is not atomic: {done}/{total} peers switched");
    }
    Ok(done == total)
}

fn uncovered_joint_peer(
    res: &CachedResource,
    promotes: &[PeerSpec],
    demotes: &[PeerSpec],
) -> Option<PeerId> {
    res.meta
        .peers
        .iter()
        .filter(|p| p.role.in_joint_state())
        .find(|p| {
            !promotes.iter().any(|s| s.peer_id == p.id)
                && !demotes.iter().any(|s| s.peer_id == p.id)
        })
        .map(|p| p.id)
}

impl OpStep {
    /// Number of conf-ver bumps the observed state already reflects for this
    /// step.
    pub fn conf_ver_changed(&self, res: &CachedResource) -> u64 {
        match self {
            OpStep::TransferLeader { .. } => 0,
            OpStep::AddLearner { container_id, peer_id } => res
                .container_peer(*container_id)
                .is_some_and(|p| p.id == *peer_id && p.role == PeerRole::Learner)
                as u64,
            OpStep::PromoteLearner { container_id, peer_id } => res
                .container_peer(*container_id)
                .is_some_and(|p| p.id == *peer_id && p.role == PeerRole::Voter)
                as u64,
            OpStep::RemovePeer { container_id, .. } => {
                res.container_peer(*container_id).is_none() as u64
            }
            OpStep::DemoteVoter { container_id, peer_id } => res
                .container_peer(*container_id)
                .is_some_and(|p| p.id == *peer_id && p.role == PeerRole::Learner)
                as u64,
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                match joint_state(
                    res,
                    promotes,
                    demotes,
                    PeerRole::Learner,
                    PeerRole::IncomingVoter,
                    PeerRole::Voter,
                    PeerRole::DemotingVoter,
                ) {
                    Ok(true) => (promotes.len() + demotes.len()) as u64,
                    _ => 0,
                }
            }
            OpStep::ChangePeerV2Leave { promotes, demotes } => {
                match joint_state(
                    res,
                    promotes,
                    demotes,
                    PeerRole::IncomingVoter,
                    PeerRole::Voter,
                    PeerRole::DemotingVoter,
                    PeerRole::Learner,
                ) {
                    Ok(true) => (promotes.len() + demotes.len()) as u64,
                    _ => 0,
                }
            }
            OpStep::SplitResource { start_version }
            | OpStep::MergeResource { start_version, .. } => {
                (res.meta.epoch.version > *start_version) as u64
            }
        }
    }

    /// Whether the observed state already reflects the step.
    pub fn is_finish(&self, res: &CachedResource) -> bool {
        match self {
            OpStep::TransferLeader { to, .. } => res.leader_container() == Some(*to),
            OpStep::AddLearner { container_id, peer_id } => {
                self.conf_ver_changed(res) == 1 && !res.peer_is_pending(*peer_id)
                    && res
                        .container_peer(*container_id)
                        .is_some_and(|p| p.id == *peer_id)
            }
            OpStep::PromoteLearner { .. }
            | OpStep::RemovePeer { .. }
            | OpStep::DemoteVoter { .. } => self.conf_ver_changed(res) == 1,
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                self.conf_ver_changed(res) == (promotes.len() + demotes.len()) as u64
            }
            OpStep::ChangePeerV2Leave { promotes, demotes } => {
                self.conf_ver_changed(res) == (promotes.len() + demotes.len()) as u64
                    && !res.meta.in_joint_state()
            }
            OpStep::SplitResource { start_version }
            | OpStep::MergeResource { start_version, .. } => {
                res.meta.epoch.version > *start_version
            }
        }
    }

    /// Reject observed states this step must not run against.
    pub fn check_safety(&self, res: &CachedResource) -> anyhow::Result<()> {
        match self {
            OpStep::TransferLeader { to, .. } => {
                let Some(peer) = res.container_peer(*to) else {
                    anyhow::bail!("transfer leader target container {to} holds no peer");
                };
                if peer.role == PeerRole::Learner {
                    anyhow::bail!("cannot transfer leader to learner peer {}", peer.id);
                }
                Ok(())
            }
            OpStep::AddLearner { container_id, peer_id } => {
                match res.container_peer(*container_id) {
                    None => Ok(()),
                    Some(peer) if peer.id == *peer_id && peer.role == PeerRole::Learner => Ok(()),
                    Some(peer) => anyhow::bail!(
                        "container {container_id} already holds peer {} with role {:?}",
                        peer.id,
                        peer.role
                    ),
                }
            }
            OpStep::PromoteLearner { container_id, peer_id } => {
                let Some(peer) = res.container_peer(*container_id) else {
                    anyhow::bail!("no peer to promote on container {container_id}");
                };
                if peer.id != *peer_id {
                    anyhow::bail!("peer on container {container_id} is {}, expected {peer_id}", peer.id);
                }
                if !matches!(peer.role, PeerRole::Learner | PeerRole::Voter) {
                    anyhow::bail!("peer {} cannot be promoted from {:?}", peer.id, peer.role);
                }
                Ok(())
            }
            OpStep::RemovePeer { container_id, .. } => {
                if res.leader_container() == Some(*container_id) {
                    anyhow::bail!("cannot remove the leader peer on container {container_id}");
                }
                Ok(())
            }
            OpStep::DemoteVoter { container_id, peer_id } => {
                let Some(peer) = res.container_peer(*container_id) else {
                    anyhow::bail!("no peer to demote on container {container_id}");
                };
                if peer.id != *peer_id {
                    anyhow::bail!("peer on container {container_id} is {}, expected {peer_id}", peer.id);
                }
                if !matches!(peer.role, PeerRole::Voter | PeerRole::Learner) {
                    anyhow::bail!("peer {} cannot be demoted from {:?}", peer.id, peer.role);
                }
                if res.leader.as_ref().map(|l| l.id) == Some(*peer_id) {
                    anyhow::bail!("cannot demote the leader peer {peer_id}");
                }
                Ok(())
            }
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                joint_state(
                    res,
                    promotes,
                    demotes,
                    PeerRole::Learner,
                    PeerRole::IncomingVoter,
                    PeerRole::Voter,
                    PeerRole::DemotingVoter,
                )?;
                if let Some(peer_id) = uncovered_joint_peer(res, promotes, demotes) {
                    anyhow::bail!("peer {peer_id} is in a joint state outside this change");
                }
                Ok(())
            }
            OpStep::ChangePeerV2Leave { promotes, demotes } => {
                if let Some(leader) = &res.leader {
                    if demotes.iter().any(|s| s.peer_id == leader.id) {
                        anyhow::bail!("cannot leave joint state while demoting leader {}", leader.id);
                    }
                }
                joint_state(
                    res,
                    promotes,
                    demotes,
                    PeerRole::IncomingVoter,
                    PeerRole::Voter,
                    PeerRole::DemotingVoter,
                    PeerRole::Learner,
                )?;
                if let Some(peer_id) = uncovered_joint_peer(res, promotes, demotes) {
                    anyhow::bail!("peer {peer_id} is in a joint state outside this change");
                }
                Ok(())
            }
            OpStep::SplitResource { .. } => Ok(()),
            OpStep::MergeResource { .. } => {
                if res.meta.in_joint_state() {
                    anyhow::bail!("cannot merge a resource in a joint state");
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for OpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpStep::TransferLeader { from, to } => {
                write!(f, "transfer leader from container {from} to container {to}")
            }
            OpStep::AddLearner { container_id, peer_id } => {
                write!(f, "add learner peer {peer_id} on container {container_id}")
            }
            OpStep::PromoteLearner { container_id, peer_id } => {
                write!(f, "promote learner peer {peer_id} on container {container_id} to voter")
            }
            OpStep::RemovePeer { container_id, peer_id } => {
                write!(f, "remove peer {peer_id} on container {container_id}")
            }
            OpStep::DemoteVoter { container_id, peer_id } => {
                write!(f, "demote voter peer {peer_id} on container {container_id} to learner")
            }
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                write!(f, "use joint consensus")?;
                for p in promotes {
                    write!(
                        f,
                        ", promote learner peer {} on container {} to voter",
                        p.peer_id, p.container_id
                    )?;
                }
                for d in demotes {
                    write!(
                        f,
                        ", demote voter peer {} on container {} to learner",
                        d.peer_id, d.container_id
                    )?;
                }
                Ok(())
            }
            OpStep::ChangePeerV2Leave { promotes, demotes } => {
                write!(f, "leave joint state")?;
                for p in promotes {
                    write!(
                        f,
                        ", promote learner peer {} on container {} to voter",
                        p.peer_id, p.container_id
                    )?;
                }
                for d in demotes {
                    write!(
                        f,
                        ", demote voter peer {} on container {} to learner",
                        d.peer_id, d.container_id
                    )?;
                }
                Ok(())
            }
            OpStep::SplitResource { .. } => write!(f, "split resource"),
            OpStep::MergeResource { to_resource, .. } => {
                write!(f, "merge into resource {to_resource}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Created,
    Started,
    Running,
    Succeeded,
    Cancelled,
    Timeout,
    Replaced,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OpStatus::Succeeded | OpStatus::Cancelled | OpStatus::Timeout | OpStatus::Replaced
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    Safety,
    Timeout,
    Stale,
    Replaced,
    Admin,
}

/// A step must observe progress within this window.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Hard deadline for the whole operator.
pub const OPERATOR_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// An ordered plan of steps against one resource.
#[derive(Debug, Clone)]
pub struct Operator {
    pub desc: String,
    pub resource_id: ResourceId,
    /// Epoch observed when the operator was built; a later conf version on
    /// the resource invalidates it.
    pub resource_epoch: Epoch,
    pub kind: OpKind,
    pub priority: OpPriority,
    pub steps: Vec<OpStep>,
    pub current_step: usize,
    pub status: OpStatus,
    pub created_at: Instant,
    pub step_started_at: Instant,
}

impl Operator {
    pub fn new(
        desc: impl Into<String>,
        resource_id: ResourceId,
        resource_epoch: Epoch,
        kind: OpKind,
        steps: Vec<OpStep>,
    ) -> Self {
        let now = Instant::now();
        Self {
            desc: desc.into(),
            resource_id,
            resource_epoch,
            kind,
            priority: OpPriority::Normal,
            steps,
            current_step: 0,
            status: OpStatus::Created,
            created_at: now,
            step_started_at: now,
        }
    }

    pub fn with_priority(mut self, priority: OpPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&OpStep> {
        self.steps.get(index)
    }

    pub fn current(&self) -> Option<&OpStep> {
        self.steps.get(self.current_step)
    }

    /// An operator not yet making progress may be displaced by a
    /// higher-priority one.
    pub fn is_replaceable(&self) -> bool {
        matches!(self.status, OpStatus::Created | OpStatus::Started)
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn step_elapsed(&self) -> Duration {
        self.step_started_at.elapsed()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (kind: {}, resource: {}, step {}/{})",
            self.desc,
            self.kind,
            self.resource_id,
            self.current_step,
            self.steps.len()
        )
    }
}
