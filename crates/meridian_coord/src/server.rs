//! Coordinator RPC server.
//!
//! One task per connection reads frames; responses travel through an
//! unbounded per-connection lane so slow peers never block the applier.
//! Heartbeats detour through the bounded ingest queue; everything else is
//! handled inline against `CoordState`.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::heartbeat::HeartbeatTask;
use crate::node::CoordState;
use crate::rpc::{self, Request, RequestBody, Response, ResponseBody, WireError};

pub struct Server {
    state: Arc<CoordState>,
    hb_tx: mpsc::Sender<HeartbeatTask>,
}

impl Server {
    pub fn new(state: Arc<CoordState>, hb_tx: mpsc::Sender<HeartbeatTask>) -> Self {
        Self { state, hb_tx }
    }

    /// Accept loop; runs until the listener is closed or the task aborted.
    pub async fn serve(self, listener: TcpListener) {
        let addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!(%addr, "rpc server listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "connection accepted");
                    let state = self.state.clone();
                    let hb_tx = self.hb_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_conn(state, hb_tx, stream).await {
                            tracing::debug!(%peer, error = %err, "connection closed");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_conn(
    state: Arc<CoordState>,
    hb_tx: mpsc::Sender<HeartbeatTask>,
    stream: TcpStream,
) -> anyhow::Result<()> {
    let framed = rpc::framed(stream);
    let (mut sink, mut frames) = framed.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        while let Some(response) = out_rx.recv().await {
            let frame = match rpc::encode(&response) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "response encoding failed");
                    continue;
                }
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut registered_container = None;
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let req: Request = match rpc::decode(&frame) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(error = %err, "malformed request frame");
                break;
            }
        };
        match req.body {
            RequestBody::RegisterContainer { container_id } => {
                // Fire-and-forget: the session becomes the push channel for
                // this container.
                registered_container = Some(container_id);
                state
                    .sessions
                    .lock()
                    .unwrap()
                    .insert(container_id, out_tx.clone());
                tracing::debug!(container = container_id, "container session registered");
            }
            RequestBody::Watch { flags } => {
                if !state.ready() {
                    let _ = out_tx.send(Response::err(req.id, WireError::NotLeader));
                    continue;
                }
                let snapshot = state.init_event();
                let mut events = state.watchers.subscribe(flags, snapshot);
                let out = out_tx.clone();
                let request_id = req.id;
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if out
                            .send(Response::ok(request_id, ResponseBody::Event(event)))
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
            RequestBody::ContainerHeartbeat { stats } => {
                if !state.ready() {
                    let _ = out_tx.send(Response::err(req.id, WireError::NotLeader));
                    continue;
                }
                let task = HeartbeatTask::Container {
                    request_id: req.id,
                    stats,
                    out: out_tx.clone(),
                };
                if hb_tx.send(task).await.is_err() {
                    let _ = out_tx.send(Response::err(req.id, WireError::ServerIsBusy));
                }
            }
            RequestBody::ResourceHeartbeat(hb) => {
                if !state.ready() {
                    let _ = out_tx.send(Response::err(req.id, WireError::NotLeader));
                    continue;
                }
                let task = HeartbeatTask::Resource {
                    request_id: req.id,
                    req: hb,
                    out: out_tx.clone(),
                };
                if hb_tx.send(task).await.is_err() {
                    let _ = out_tx.send(Response::err(req.id, WireError::ServerIsBusy));
                }
            }
            _ => {
                let response = state.handle_request(req);
                let _ = out_tx.send(response);
            }
        }
    }

    if let Some(container_id) = registered_container {
        let mut sessions = state.sessions.lock().unwrap();
        if sessions
            .get(&container_id)
            .is_some_and(|tx| tx.same_channel(&out_tx))
        {
            sessions.remove(&container_id);
        }
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

/// Convenience used by tests and the binary: bind, then serve in the
/// background, returning the bound address.
pub async fn spawn_server(
    state: Arc<CoordState>,
    hb_tx: mpsc::Sender<HeartbeatTask>,
    bind: &str,
) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    let server = Server::new(state, hb_tx);
    let handle = tokio::spawn(async move {
        server.serve(listener).await;
    });
    Ok((addr, handle))
}
