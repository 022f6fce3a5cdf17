//! Heartbeat ingest pipeline.
//!
//! Connections fan heartbeats into one bounded queue; a single applier task
//! drains it, which preserves arrival order per container and keeps all
//! cache mutation on one writer. The bounded send gives natural
//! backpressure toward the socket.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::meta::ContainerStats;
use crate::node::CoordState;
use crate::rpc::{Response, ResponseBody, ResourceHeartbeatReq};

pub const HEARTBEAT_QUEUE_CAPACITY: usize = 128;

/// One queued heartbeat, with the connection's outbound lane for the reply.
pub enum HeartbeatTask {
    Container {
        request_id: u64,
        stats: ContainerStats,
        out: mpsc::UnboundedSender<Response>,
    },
    Resource {
        request_id: u64,
        req: Box<ResourceHeartbeatReq>,
        out: mpsc::UnboundedSender<Response>,
    },
}

pub fn spawn_applier(
    state: Arc<CoordState>,
) -> (mpsc::Sender<HeartbeatTask>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<HeartbeatTask>(HEARTBEAT_QUEUE_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            match task {
                HeartbeatTask::Container { request_id, stats, out } => {
                    let response = match state.handle_container_heartbeat(stats) {
                        Ok(rsp) => {
                            Response::ok(request_id, ResponseBody::ContainerHeartbeat(rsp))
                        }
                        Err(err) => Response::err(request_id, err),
                    };
                    let _ = out.send(response);
                }
                HeartbeatTask::Resource { request_id, req, out } => {
                    let response = match state.handle_resource_heartbeat(*req) {
                        Ok(rsp) => Response::ok(request_id, ResponseBody::ResourceHeartbeat(rsp)),
                        Err(err) => Response::err(request_id, err),
                    };
                    let _ = out.send(response);
                }
            }
        }
        tracing::info!("heartbeat applier stopped");
    });
    (tx, handle)
}
