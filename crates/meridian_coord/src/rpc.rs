//! Wire protocol: length-prefixed JSON frames.
//!
//! Every request carries a client-assigned id echoed in the response. The
//! concrete encoding is deliberately simple; the framing (and the error
//! taxonomy) is the contract.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::event::{Event, EventFlags};
use crate::meta::{
    ContainerId, ContainerMeta, ContainerStats, DestroyingStatus, Job, Peer, PeerId, PeerStats,
    ResourceId, ResourceMeta, ResourceState, ScheduleGroupRule,
};
use crate::placement::Rule;
use crate::schedule::OpStep;

/// Frames larger than this are refused (surfaced as `RaftEntryTooLarge`).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn codec() -> LengthDelimitedCodec {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_FRAME_LEN);
    codec
}

pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(stream, codec())
}

pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Errors surfaced on the wire so clients can re-route or retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum WireError {
    #[error("not leader")]
    NotLeader,
    #[error("store does not match")]
    StoreNotMatch,
    #[error("shard not found")]
    ShardNotFound,
    #[error("key not in shard [{start:?}, {end:?})")]
    KeyNotInShard { start: Vec<u8>, end: Vec<u8> },
    #[error("stale epoch")]
    StaleEpoch { new_shards: Vec<ResourceMeta> },
    #[error("stale command")]
    StaleCommand,
    #[error("server is busy")]
    ServerIsBusy,
    #[error("raft entry too large ({size} bytes)")]
    RaftEntryTooLarge { size: u64 },
    #[error("{0}")]
    Internal(String),
}

impl WireError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        WireError::Internal(err.to_string())
    }

    /// Retryable after a leader re-discovery.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, WireError::NotLeader)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHeartbeatReq {
    pub container_id: ContainerId,
    pub resource: ResourceMeta,
    pub leader: Option<Peer>,
    #[serde(default)]
    pub down_peers: Vec<PeerStats>,
    #[serde(default)]
    pub pending_peers: Vec<Peer>,
    #[serde(default)]
    pub written_bytes: u64,
    #[serde(default)]
    pub written_keys: u64,
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub read_keys: u64,
    #[serde(default)]
    pub approximate_size: u64,
    /// Report window in seconds.
    #[serde(default)]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHeartbeatRsp {
    pub resource_id: ResourceId,
    /// Next operator step for the shard leader to execute.
    pub step: Option<OpStep>,
    /// The replica should destroy itself without waiting for a report.
    #[serde(default)]
    pub destroy_directly: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerHeartbeatRsp {
    /// Pending steps for resources whose leader is on this container.
    pub steps: Vec<(ResourceId, OpStep)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitId {
    pub new_resource_id: ResourceId,
    pub new_peer_ids: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    AllocId,
    PutContainer { container: ContainerMeta },
    GetContainer { container_id: ContainerId },
    ContainerHeartbeat { stats: ContainerStats },
    ResourceHeartbeat(Box<ResourceHeartbeatReq>),
    AskBatchSplit { resource: ResourceMeta, count: u32 },
    CreateResources { resources: Vec<ResourceMeta>, least_replicas: Vec<usize> },
    RemoveResources { ids: Vec<ResourceId> },
    CheckResourceState { ids: Vec<ResourceId> },
    PutPlacementRule { rule: Rule },
    GetAppliedRules { resource_id: ResourceId },
    AddScheduleGroupRule { rule: ScheduleGroupRule },
    GetScheduleGroupRule,
    CreateJob { job: Job },
    RemoveJob { job: Job },
    ExecuteJob { job: Job, data: Vec<u8> },
    CreateDestroying {
        id: ResourceId,
        index: u64,
        remove_data: bool,
        replicas: Vec<PeerId>,
    },
    ReportDestroyed { id: ResourceId, replica_id: PeerId },
    GetDestroying { id: ResourceId },
    RegisterContainer { container_id: ContainerId },
    Watch { flags: EventFlags },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Empty,
    AllocId { id: u64 },
    GetContainer { container: ContainerMeta },
    ContainerHeartbeat(ContainerHeartbeatRsp),
    ResourceHeartbeat(ResourceHeartbeatRsp),
    AskBatchSplit { split_ids: Vec<SplitId> },
    CheckResourceState {
        destroying: Vec<ResourceId>,
        destroyed: Vec<ResourceId>,
    },
    GetAppliedRules { rules: Vec<Rule> },
    GetScheduleGroupRule { rules: Vec<ScheduleGroupRule> },
    ExecuteJob { data: Vec<u8> },
    DestroyingState { state: ResourceState },
    GetDestroying { status: Option<DestroyingStatus> },
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub error: Option<WireError>,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(id: u64, body: ResponseBody) -> Self {
        Self { id, error: None, body }
    }

    pub fn err(id: u64, error: WireError) -> Self {
        Self {
            id,
            error: Some(error),
            body: ResponseBody::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Epoch;
    use std::collections::BTreeMap;

    #[test]
    fn request_roundtrip() {
        let req = Request {
            id: 42,
            body: RequestBody::ResourceHeartbeat(Box::new(ResourceHeartbeatReq {
                container_id: 1,
                resource: ResourceMeta {
                    id: 9,
                    group: 2,
                    start_key: b"a".to_vec(),
                    end_key: b"b".to_vec(),
                    epoch: Epoch { conf_ver: 3, version: 4 },
                    peers: vec![],
                    labels: BTreeMap::new(),
                    state: ResourceState::Running,
                    rule_groups: vec!["g".into()],
                },
                leader: None,
                down_peers: vec![],
                pending_peers: vec![],
                written_bytes: 10,
                written_keys: 1,
                read_bytes: 0,
                read_keys: 0,
                approximate_size: 96,
                interval_secs: 60,
            })),
        };
        let bytes = encode(&req).unwrap();
        let back: Request = decode(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn wire_error_roundtrip() {
        let rsp = Response::err(7, WireError::KeyNotInShard { start: b"a".to_vec(), end: b"z".to_vec() });
        let bytes = encode(&rsp).unwrap();
        let back: Response = decode(&bytes).unwrap();
        assert_eq!(back, rsp);
        assert!(!back.error.unwrap().is_not_leader());
    }

    #[test]
    fn not_leader_is_the_retry_sentinel() {
        assert!(WireError::NotLeader.is_not_leader());
        assert!(!WireError::ServerIsBusy.is_not_leader());
    }
}
