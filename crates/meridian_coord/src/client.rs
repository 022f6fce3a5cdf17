//! Coordinator client.
//!
//! One long-lived TCP session to the current leader. A writer task
//! multiplexes requests under monotonically increasing ids; a reader task
//! resolves per-request promises; a reset lane rebuilds the connection
//! through the pluggable leader getter whenever the link drops or the
//! server answers `NotLeader`.
//!
//! Backpressure on the writer queue blocks the caller with cancellation;
//! `close` never waits behind a stuck writer and drains in-flight promises
//! exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::event::{Event, EventFlags};
use crate::meta::{
    ContainerId, ContainerMeta, ContainerStats, DestroyingStatus, Job, PeerId, ResourceId,
    ResourceMeta, ResourceState, ScheduleGroupRule,
};
use crate::placement::Rule;
use crate::rpc::{
    self, ContainerHeartbeatRsp, Request, RequestBody, Response, ResponseBody,
    ResourceHeartbeatReq, ResourceHeartbeatRsp, SplitId, WireError,
};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_PAUSE: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(200);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,
    #[error("rpc timeout")]
    Timeout,
    #[error("not leader")]
    NotLeader,
    #[error("server error: {0}")]
    Server(WireError),
    #[error("{0}")]
    Other(String),
}

pub type LeaderGetter = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct ClientOptions {
    pub rpc_timeout: Duration,
    pub leader_getter: LeaderGetter,
}

impl ClientOptions {
    pub fn new(leader_getter: LeaderGetter) -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            leader_getter,
        }
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

type WriteSink = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;
type ReadStream = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

struct Inner {
    opts: ClientOptions,
    next_id: AtomicU64,
    container_id: AtomicU64,
    closed: AtomicBool,
    drained: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<ResponseBody, ClientError>>>>,
    watchers: Mutex<HashMap<u64, (EventFlags, mpsc::UnboundedSender<Event>)>>,
    write_tx: mpsc::Sender<Request>,
    reset_tx: mpsc::Sender<()>,
    hb_tx: mpsc::UnboundedSender<ResourceHeartbeatRsp>,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn running(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn schedule_reset(&self) {
        // A full reset lane already means a reconnect is on its way.
        let _ = self.reset_tx.try_send(());
    }

    /// Fail every in-flight promise exactly once.
    fn drain_pending(&self, err: ClientError) {
        if self.drained.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<_> = {
            let mut map = self.pending.lock().unwrap();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(err.clone()));
        }
        self.watchers.lock().unwrap().clear();
    }

    fn resolve(&self, id: u64, result: Result<ResponseBody, ClientError>) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Route one decoded response. Returns true when the connection must be
    /// rebuilt.
    fn route(&self, response: Response) -> bool {
        if let Some(err) = &response.error {
            if err.is_not_leader() {
                // The promise stays resolvable: the caller retries after the
                // reconnect.
                self.resolve(response.id, Err(ClientError::NotLeader));
                return true;
            }
            self.resolve(response.id, Err(ClientError::Server(err.clone())));
            return false;
        }
        match response.body {
            ResponseBody::ResourceHeartbeat(rsp) if rsp.resource_id > 0 => {
                let _ = self.hb_tx.send(rsp);
                false
            }
            ResponseBody::Event(event) => {
                let mut watchers = self.watchers.lock().unwrap();
                if let Some((_, tx)) = watchers.get(&response.id) {
                    if tx.send(event).is_err() {
                        watchers.remove(&response.id);
                    }
                }
                false
            }
            body => {
                self.resolve(response.id, Ok(body));
                false
            }
        }
    }
}

/// Handle to the coordinator cluster.
#[derive(Clone)]
pub struct CoordClient {
    inner: Arc<Inner>,
    hb_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ResourceHeartbeatRsp>>>>,
}

impl CoordClient {
    pub fn new(opts: ClientOptions) -> Self {
        let (write_tx, write_rx) = mpsc::channel(128);
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let (hb_tx, hb_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            opts,
            next_id: AtomicU64::new(0),
            container_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            write_tx,
            reset_tx,
            hb_tx,
            shutdown,
        });

        let (conn_tx, conn_rx) = mpsc::channel::<ReadStream>(1);
        tokio::spawn(run_writer(inner.clone(), write_rx, reset_rx, conn_tx));
        tokio::spawn(run_reader(inner.clone(), conn_rx));
        inner.schedule_reset();

        Self {
            inner,
            hb_rx: Arc::new(Mutex::new(Some(hb_rx))),
        }
    }

    /// Stop both loops, drop the connection, fail in-flight calls with
    /// `Closed`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        self.inner.drain_pending(ClientError::Closed);
        tracing::info!("coordinator client closed");
    }

    /// The channel operator steps arrive on; take it once.
    pub fn heartbeat_rsp_notifier(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ResourceHeartbeatRsp>, ClientError> {
        if !self.inner.running() {
            return Err(ClientError::Closed);
        }
        self.hb_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ClientError::Other("heartbeat notifier already taken".into()))
    }

    /// Blockingly enqueue a request, cancelled by `close`.
    async fn enqueue(&self, req: Request) -> Result<(), ClientError> {
        if !self.inner.running() {
            return Err(ClientError::Closed);
        }
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            sent = self.inner.write_tx.send(req) => {
                sent.map_err(|_| ClientError::Closed)
            }
            _ = shutdown.changed() => Err(ClientError::Closed),
        }
    }

    /// Send and wait, retrying transparently across leader changes.
    async fn sync_do(&self, body: RequestBody) -> Result<ResponseBody, ClientError> {
        loop {
            if !self.inner.running() {
                return Err(ClientError::Closed);
            }
            let id = self.inner.next_id();
            let (tx, rx) = oneshot::channel();
            self.inner.pending.lock().unwrap().insert(id, tx);
            self.enqueue(Request { id, body: body.clone() }).await?;

            let outcome = tokio::time::timeout(self.inner.opts.rpc_timeout, rx).await;
            match outcome {
                Err(_) => {
                    self.inner.pending.lock().unwrap().remove(&id);
                    return Err(ClientError::Timeout);
                }
                Ok(Err(_)) => return Err(ClientError::Closed),
                Ok(Ok(Err(ClientError::NotLeader))) => {
                    tokio::time::sleep(RETRY_PAUSE).await;
                    continue;
                }
                Ok(Ok(result)) => return result,
            }
        }
    }

    /// Fire-and-forget send; the response, if any, flows through the
    /// heartbeat notifier.
    async fn async_do(&self, body: RequestBody) -> Result<(), ClientError> {
        let id = self.inner.next_id();
        self.enqueue(Request { id, body }).await
    }

    pub async fn alloc_id(&self) -> Result<u64, ClientError> {
        match self.sync_do(RequestBody::AllocId).await? {
            ResponseBody::AllocId { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn put_container(&self, container: ContainerMeta) -> Result<(), ClientError> {
        self.inner
            .container_id
            .store(container.id, Ordering::Release);
        self.sync_do(RequestBody::PutContainer { container }).await?;
        // Announce the session so the leader can push to this container.
        self.async_do(RequestBody::RegisterContainer {
            container_id: self.inner.container_id.load(Ordering::Acquire),
        })
        .await
    }

    pub async fn get_container(&self, container_id: ContainerId) -> Result<ContainerMeta, ClientError> {
        match self.sync_do(RequestBody::GetContainer { container_id }).await? {
            ResponseBody::GetContainer { container } => Ok(container),
            other => Err(unexpected(other)),
        }
    }

    pub async fn container_heartbeat(
        &self,
        stats: ContainerStats,
    ) -> Result<ContainerHeartbeatRsp, ClientError> {
        match self.sync_do(RequestBody::ContainerHeartbeat { stats }).await? {
            ResponseBody::ContainerHeartbeat(rsp) => Ok(rsp),
            other => Err(unexpected(other)),
        }
    }

    pub async fn resource_heartbeat(&self, req: ResourceHeartbeatReq) -> Result<(), ClientError> {
        if !self.inner.running() {
            return Err(ClientError::Closed);
        }
        self.async_do(RequestBody::ResourceHeartbeat(Box::new(req))).await
    }

    pub async fn ask_batch_split(
        &self,
        resource: ResourceMeta,
        count: u32,
    ) -> Result<Vec<SplitId>, ClientError> {
        match self.sync_do(RequestBody::AskBatchSplit { resource, count }).await? {
            ResponseBody::AskBatchSplit { split_ids } => Ok(split_ids),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_resources(&self, resources: Vec<ResourceMeta>) -> Result<(), ClientError> {
        let least = vec![0; resources.len()];
        self.create_resources_with_least_replicas(resources, least).await
    }

    pub async fn create_resources_with_least_replicas(
        &self,
        resources: Vec<ResourceMeta>,
        least_replicas: Vec<usize>,
    ) -> Result<(), ClientError> {
        self.sync_do(RequestBody::CreateResources { resources, least_replicas })
            .await
            .map(|_| ())
    }

    pub async fn remove_resources(&self, ids: Vec<ResourceId>) -> Result<(), ClientError> {
        self.sync_do(RequestBody::RemoveResources { ids }).await.map(|_| ())
    }

    pub async fn check_resource_state(
        &self,
        ids: Vec<ResourceId>,
    ) -> Result<(Vec<ResourceId>, Vec<ResourceId>), ClientError> {
        match self.sync_do(RequestBody::CheckResourceState { ids }).await? {
            ResponseBody::CheckResourceState { destroying, destroyed } => {
                Ok((destroying, destroyed))
            }
            other => Err(unexpected(other)),
        }
    }

    pub async fn put_placement_rule(&self, rule: Rule) -> Result<(), ClientError> {
        self.sync_do(RequestBody::PutPlacementRule { rule }).await.map(|_| ())
    }

    pub async fn get_applied_rules(&self, resource_id: ResourceId) -> Result<Vec<Rule>, ClientError> {
        match self.sync_do(RequestBody::GetAppliedRules { resource_id }).await? {
            ResponseBody::GetAppliedRules { rules } => Ok(rules),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_schedule_group_rule(&self, rule: ScheduleGroupRule) -> Result<(), ClientError> {
        self.sync_do(RequestBody::AddScheduleGroupRule { rule }).await.map(|_| ())
    }

    pub async fn get_schedule_group_rules(&self) -> Result<Vec<ScheduleGroupRule>, ClientError> {
        match self.sync_do(RequestBody::GetScheduleGroupRule).await? {
            ResponseBody::GetScheduleGroupRule { rules } => Ok(rules),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_job(&self, job: Job) -> Result<(), ClientError> {
        self.sync_do(RequestBody::CreateJob { job }).await.map(|_| ())
    }

    pub async fn remove_job(&self, job: Job) -> Result<(), ClientError> {
        self.sync_do(RequestBody::RemoveJob { job }).await.map(|_| ())
    }

    pub async fn execute_job(&self, job: Job, data: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        match self.sync_do(RequestBody::ExecuteJob { job, data }).await? {
            ResponseBody::ExecuteJob { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_destroying(
        &self,
        id: ResourceId,
        index: u64,
        remove_data: bool,
        replicas: Vec<PeerId>,
    ) -> Result<ResourceState, ClientError> {
        match self
            .sync_do(RequestBody::CreateDestroying { id, index, remove_data, replicas })
            .await?
        {
            ResponseBody::DestroyingState { state } => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn report_destroyed(
        &self,
        id: ResourceId,
        replica_id: PeerId,
    ) -> Result<ResourceState, ClientError> {
        match self.sync_do(RequestBody::ReportDestroyed { id, replica_id }).await? {
            ResponseBody::DestroyingState { state } => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_destroying(
        &self,
        id: ResourceId,
    ) -> Result<Option<DestroyingStatus>, ClientError> {
        match self.sync_do(RequestBody::GetDestroying { id }).await? {
            ResponseBody::GetDestroying { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Subscribe to cluster events. The `Init` snapshot arrives first; the
    /// subscription survives leader changes through re-registration.
    pub async fn watch(&self, flags: EventFlags) -> Result<mpsc::UnboundedReceiver<Event>, ClientError> {
        if !self.inner.running() {
            return Err(ClientError::Closed);
        }
        let id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watchers.lock().unwrap().insert(id, (flags, tx));
        self.enqueue(Request { id, body: RequestBody::Watch { flags } }).await?;
        Ok(rx)
    }
}

fn unexpected(body: ResponseBody) -> ClientError {
    ClientError::Other(format!("unexpected response body: {body:?}"))
}

/// Writer loop: owns the outbound half of the connection and the reconnect
/// procedure.
async fn run_writer(
    inner: Arc<Inner>,
    mut write_rx: mpsc::Receiver<Request>,
    mut reset_rx: mpsc::Receiver<()>,
    conn_tx: mpsc::Sender<ReadStream>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut sink: Option<WriteSink> = None;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                inner.drain_pending(ClientError::Closed);
                tracing::debug!("client write loop stopped");
                return;
            }
            req = write_rx.recv() => {
                let Some(req) = req else { return };
                let Some(active) = sink.as_mut() else {
                    tracing::debug!(id = req.id, "no leader connection, dropping request");
                    inner.schedule_reset();
                    continue;
                };
                let frame = match rpc::encode(&req) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error = %err, "request encoding failed");
                        continue;
                    }
                };
                if let Err(err) = active.send(frame).await {
                    tracing::warn!(id = req.id, error = %err, "send to leader failed");
                    sink = None;
                    inner.schedule_reset();
                }
            }
            reset = reset_rx.recv() => {
                if reset.is_none() {
                    return;
                }
                sink = reconnect(&inner, &conn_tx).await;
            }
        }
    }
}

/// Rebuild the leader connection: poll the leader getter with exponential
/// backoff, announce the container session and re-issue watcher
/// registrations on success.
async fn reconnect(inner: &Arc<Inner>, conn_tx: &mpsc::Sender<ReadStream>) -> Option<WriteSink> {
    let mut backoff = RECONNECT_BACKOFF_START;
    loop {
        if !inner.running() {
            return None;
        }
        let addr = (inner.opts.leader_getter)();
        if let Some(addr) = addr {
            tracing::info!(leader = %addr, "connecting to leader");
            let connect = tokio::time::timeout(inner.opts.rpc_timeout, TcpStream::connect(&addr));
            match connect.await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let (read_half, write_half) = stream.into_split();
                    let mut sink = FramedWrite::new(write_half, rpc::codec());
                    let frames = FramedRead::new(read_half, rpc::codec());
                    if conn_tx.send(frames).await.is_err() {
                        return None;
                    }

                    let container_id = inner.container_id.load(Ordering::Acquire);
                    if container_id > 0 {
                        let req = Request {
                            id: inner.next_id(),
                            body: RequestBody::RegisterContainer { container_id },
                        };
                        if let Ok(frame) = rpc::encode(&req) {
                            let _ = sink.send(frame).await;
                        }
                    }
                    let watchers: Vec<(u64, EventFlags)> = inner
                        .watchers
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|(id, (flags, _))| (*id, *flags))
                        .collect();
                    for (id, flags) in watchers {
                        let req = Request { id, body: RequestBody::Watch { flags } };
                        if let Ok(frame) = rpc::encode(&req) {
                            let _ = sink.send(frame).await;
                        }
                    }

                    tracing::info!(leader = %addr, "connected to leader");
                    return Some(sink);
                }
                Ok(Err(err)) => {
                    tracing::warn!(leader = %addr, error = %err, "leader connect failed");
                }
                Err(_) => {
                    tracing::warn!(leader = %addr, "leader connect timed out");
                }
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
    }
}

/// Reader loop: demultiplex responses from whichever connection is current.
async fn run_reader(inner: Arc<Inner>, mut conn_rx: mpsc::Receiver<ReadStream>) {
    let mut shutdown = inner.shutdown.subscribe();
    'outer: loop {
        let frames = tokio::select! {
            _ = shutdown.changed() => break 'outer,
            conn = conn_rx.recv() => conn,
        };
        let Some(mut frames) = frames else {
            break;
        };
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break 'outer,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(bytes)) => {
                    let response: Response = match rpc::decode(&bytes) {
                        Ok(response) => response,
                        Err(err) => {
                            tracing::warn!(error = %err, "malformed response frame");
                            continue;
                        }
                    };
                    if inner.route(response) {
                        inner.schedule_reset();
                        continue 'outer;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "read from leader failed");
                    inner.schedule_reset();
                    continue 'outer;
                }
                None => {
                    if inner.running() {
                        tracing::info!("leader connection closed");
                        inner.schedule_reset();
                    }
                    continue 'outer;
                }
            }
        }
    }
    inner.drain_pending(ClientError::Closed);
    tracing::debug!("client read loop stopped");
}
