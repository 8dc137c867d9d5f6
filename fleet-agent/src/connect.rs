use crate::execute::Execute;
use fleet_controller_core::{
    tunnel::{AgentFrame, Hello, ResponseFrame, ServerFrame},
    Backoff, Error,
};
use fleet_controller_tunnel::ws;
use futures::prelude::*;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::mpsc,
    task::AbortHandle,
    time::{self, Duration},
};
use tokio_tungstenite::connect_async;
use tracing::{debug, debug_span, info, warn, Instrument};

#[derive(Clone, Debug)]
pub struct Config {
    /// The control plane's agent endpoint, e.g. `wss://fleet.example.com/api/agent/connect`.
    pub url: String,
    pub hello: Hello,
    pub handshake_timeout: Duration,
    pub backoff: Backoff,
}

/// Holds a tunnel open to the control plane and serves the requests sent over it.
pub struct Agent<E> {
    config: Config,
    executor: Arc<E>,
}

impl<E: Execute> Agent<E> {
    pub fn new(config: Config, executor: E) -> Self {
        Self {
            config,
            executor: Arc::new(executor),
        }
    }

    /// Connects to the control plane, reconnecting with backoff whenever the tunnel is lost,
    /// until shutdown is signaled.
    pub async fn run(self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        let mut failures = 0;
        loop {
            let result = tokio::select! {
                res = self.connect(&mut failures) => res,
                _ = &mut shutdown => {
                    info!("Disconnecting from control plane");
                    return;
                }
            };
            match result {
                Ok(()) => info!("Control plane closed the tunnel"),
                Err(error) => warn!(%error, "Tunnel failed"),
            }

            failures += 1;
            let delay = self.config.backoff.delay(failures);
            debug!(?delay, failures, "Reconnecting");
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    async fn connect(&self, failures: &mut u32) -> Result<(), Error> {
        let (socket, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;
        let (frames, sink) = ws::frames::<_, ServerFrame, AgentFrame>(socket);
        tokio::pin!(frames, sink);

        let session_id = handshake(
            frames.as_mut(),
            sink.as_mut(),
            self.config.hello.clone(),
            self.config.handshake_timeout,
        )
        .await?;
        *failures = 0;
        info!(session_id, "Connected to control plane");

        serve(frames, sink, self.executor.clone()).await
    }
}

/// Presents the agent's hello, returning the session id the control plane assigned.
pub(crate) async fn handshake<S, K>(
    mut frames: S,
    mut sink: K,
    hello: Hello,
    timeout: Duration,
) -> Result<u64, Error>
where
    S: Stream<Item = Result<ServerFrame, Error>> + Unpin,
    K: Sink<AgentFrame, Error = Error> + Unpin,
{
    sink.send(AgentFrame::Hello(hello)).await?;
    match time::timeout(timeout, frames.next()).await {
        Ok(Some(Ok(ServerFrame::Welcome { session_id }))) => Ok(session_id),
        Ok(Some(Ok(ServerFrame::Rejected { reason }))) => Err(Error::protocol(format_args!(
            "rejected by control plane: {reason}"
        ))),
        Ok(Some(Ok(frame))) => Err(Error::protocol(format_args!(
            "expected welcome, got {frame:?}"
        ))),
        Ok(Some(Err(error))) => Err(error),
        Ok(None) => Err(Error::SessionClosed),
        Err(_) => Err(Error::Timeout),
    }
}

/// Serves requests until the tunnel closes. Each request runs in its own task, which is aborted
/// if the request is cancelled or the tunnel is lost.
pub(crate) async fn serve<S, K, E>(
    mut frames: S,
    mut sink: K,
    executor: Arc<E>,
) -> Result<(), Error>
where
    S: Stream<Item = Result<ServerFrame, Error>> + Unpin,
    K: Sink<AgentFrame, Error = Error> + Unpin,
    E: Execute,
{
    let (done_tx, mut done_rx) = mpsc::channel::<ResponseFrame>(64);
    let mut inflight = HashMap::<u64, AbortHandle>::new();

    let result = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                None => break Ok(()),
                Some(Err(error)) => break Err(error),
                Some(Ok(ServerFrame::Request(request))) => {
                    let request_id = request.request_id;
                    let executor = executor.clone();
                    let done = done_tx.clone();
                    let task = tokio::spawn(
                        async move {
                            let rsp = executor.execute(request).await;
                            let _ = done.send(rsp).await;
                        }
                        .instrument(debug_span!("request", id = request_id)),
                    );
                    inflight.insert(request_id, task.abort_handle());
                }
                Some(Ok(ServerFrame::Cancel { request_id })) => {
                    if let Some(task) = inflight.remove(&request_id) {
                        debug!(request_id, "Cancelled");
                        task.abort();
                    }
                }
                Some(Ok(ServerFrame::Ping)) => {
                    if let Err(error) = sink.send(AgentFrame::Pong).await {
                        break Err(error);
                    }
                }
                Some(Ok(frame)) => debug!(?frame, "Ignoring unexpected frame"),
            },

            Some(rsp) = done_rx.recv() => {
                // A response that raced with its cancellation is dropped.
                if inflight.remove(&rsp.request_id).is_some() {
                    if let Err(error) = sink.send(AgentFrame::Response(rsp)).await {
                        break Err(error);
                    }
                }
            }
        }
    };

    for task in inflight.values() {
        task.abort();
    }
    result
}
