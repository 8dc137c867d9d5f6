use crate::{server::Config, TunnelMetrics};
use ahash::AHashMap as HashMap;
use fleet_controller_core::{
    tunnel::{AgentFrame, ProxyRequest, ResponseFrame, ServerFrame},
    ClusterId, Error,
};
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// A handle to an authenticated agent connection.
///
/// Requests are multiplexed over the connection and correlated with their responses by a
/// per-session request id. All writes go through a single writer task; a reader task dispatches
/// responses to waiting callers and watches for idleness.
#[derive(Clone)]
pub struct Session(Arc<Shared>);

struct Shared {
    id: u64,
    cluster: ClusterId,
    agent_id: String,
    frames: mpsc::Sender<ServerFrame>,
    pending: Mutex<Pending>,
    next_request: AtomicU64,
    closed: CancellationToken,
    last_seen: Mutex<Instant>,
    metrics: TunnelMetrics,
}

type Reply = oneshot::Sender<Result<ResponseFrame, Error>>;

struct Pending {
    /// Cleared when the session closes so that no request is admitted afterwards.
    open: bool,
    requests: HashMap<u64, Reply>,
}

/// Removes a request's pending entry when its caller stops waiting. If the entry is still there
/// the request was abandoned, so the agent is told to stop working on it.
struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: u64,
}

// === impl Session ===

impl Session {
    pub(crate) fn new(
        id: u64,
        cluster: ClusterId,
        agent_id: String,
        config: &Config,
        metrics: TunnelMetrics,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (frames, rx) = mpsc::channel(config.queue_depth.max(1));
        let shared = Shared {
            id,
            cluster,
            agent_id,
            frames,
            pending: Mutex::new(Pending {
                open: true,
                requests: HashMap::default(),
            }),
            next_request: AtomicU64::new(0),
            closed: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
            metrics,
        };
        (Self(Arc::new(shared)), rx)
    }

    /// Spawns the reader and writer tasks. The writer sends `first` before anything else.
    pub(crate) fn start<S, K>(
        &self,
        first: ServerFrame,
        frames: mpsc::Receiver<ServerFrame>,
        stream: S,
        sink: K,
        config: &Config,
    ) where
        S: Stream<Item = Result<AgentFrame, Error>> + Send + Unpin + 'static,
        K: Sink<ServerFrame, Error = Error> + Send + Unpin + 'static,
    {
        let span = info_span!(
            "session",
            cluster = %self.0.cluster,
            agent = %self.0.agent_id,
            session = self.0.id,
        );
        tokio::spawn(
            self.clone()
                .write(first, frames, sink)
                .instrument(span.clone()),
        );
        tokio::spawn(
            self.clone()
                .read(stream, config.heartbeat_interval, config.idle_timeout)
                .instrument(span),
        );
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.0.cluster
    }

    pub fn agent_id(&self) -> &str {
        &self.0.agent_id
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.is_cancelled()
    }

    /// Completes when the session has closed.
    pub async fn closed(&self) {
        self.0.closed.cancelled().await
    }

    /// Sends a request to the agent and waits for its response.
    ///
    /// Fails with `Timeout` if no response arrives within `timeout`, in which case the agent is
    /// asked to cancel the request, and with `SessionClosed` if the session ends first.
    pub async fn send(
        &self,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<ResponseFrame, Error> {
        let request_id = self.0.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.0.pending.lock();
            if !pending.open {
                return Err(Error::SessionClosed);
            }
            pending.requests.insert(request_id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.0,
            request_id,
        };

        let frame = ServerFrame::Request(request.into_frame(request_id));
        trace!(request_id, "Sending request");
        let exchange = async {
            self.0
                .frames
                .send(frame)
                .await
                .map_err(|_| Error::SessionClosed)?;
            rx.await.map_err(|_| Error::SessionClosed)?
        };
        match time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(request_id, ?timeout, "Request timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Closes the session, failing every pending request with `SessionClosed`.
    pub fn close(&self, reason: impl fmt::Display) {
        let drained = {
            let mut pending = self.0.pending.lock();
            if !pending.open {
                return;
            }
            pending.open = false;
            std::mem::take(&mut pending.requests)
        };
        self.0.closed.cancel();
        info!(%reason, pending = drained.len(), "Session closed");
        for (_, reply) in drained {
            let _ = reply.send(Err(Error::SessionClosed));
        }
    }

    async fn write<K>(
        self,
        first: ServerFrame,
        mut frames: mpsc::Receiver<ServerFrame>,
        mut sink: K,
    ) where
        K: Sink<ServerFrame, Error = Error> + Unpin,
    {
        let mut next = Some(first);
        loop {
            let frame = match next.take() {
                Some(frame) => frame,
                None => tokio::select! {
                    biased;
                    _ = self.0.closed.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                },
            };
            if let Err(error) = sink.send(frame).await {
                self.close(format_args!("write failed: {error}"));
                break;
            }
        }
        if let Err(error) = sink.close().await {
            debug!(%error, "Failed to close connection");
        }
    }

    async fn read<S>(self, mut stream: S, heartbeat: Duration, idle_timeout: Duration)
    where
        S: Stream<Item = Result<AgentFrame, Error>> + Unpin,
    {
        let mut heartbeats = time::interval_at(Instant::now() + heartbeat, heartbeat);
        heartbeats.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = self.0.closed.cancelled() => return,

                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        *self.0.last_seen.lock() = Instant::now();
                        self.handle(frame);
                    }
                    Some(Err(error)) => break format!("read failed: {error}"),
                    None => break "agent disconnected".to_string(),
                },

                _ = heartbeats.tick() => {
                    let idle = self.0.last_seen.lock().elapsed();
                    if idle > idle_timeout {
                        break format!("no frames received for {}s", idle.as_secs());
                    }
                    if self.0.frames.try_send(ServerFrame::Ping).is_err() {
                        debug!("Write queue is full; skipping heartbeat");
                    }
                }
            }
        };
        self.close(reason);
    }

    fn handle(&self, frame: AgentFrame) {
        match frame {
            AgentFrame::Response(rsp) => self.complete(rsp),
            AgentFrame::Pong => trace!("Pong"),
            AgentFrame::Hello(_) => warn!("Ignoring repeated hello"),
        }
    }

    fn complete(&self, mut rsp: ResponseFrame) {
        let request_id = rsp.request_id;
        let reply = self.0.pending.lock().requests.remove(&request_id);
        let Some(reply) = reply else {
            // The caller timed out or went away.
            debug!(request_id, "Dropping response to unknown request");
            self.0.metrics.stale_response();
            return;
        };
        let result = match rsp.error.take() {
            Some(error) => Err(Error::UpstreamUnreachable(error)),
            None => Ok(rsp),
        };
        let _ = reply.send(result);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.0.id)
            .field("cluster", &self.0.cluster)
            .field("agent_id", &self.0.agent_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// === impl PendingGuard ===

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self
            .shared
            .pending
            .lock()
            .requests
            .remove(&self.request_id)
            .is_some();
        if abandoned && !self.shared.closed.is_cancelled() {
            trace!(request_id = self.request_id, "Cancelling request");
            let cancel = ServerFrame::Cancel {
                request_id: self.request_id,
            };
            if self.shared.frames.try_send(cancel).is_err() {
                debug!(request_id = self.request_id, "Failed to enqueue cancel");
            }
        }
    }
}
