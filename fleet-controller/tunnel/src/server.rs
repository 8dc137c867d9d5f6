use crate::{Session, TunnelMetrics};
use ahash::AHashMap as HashMap;
use fleet_controller_core::{
    tunnel::{AgentFrame, Hello, ProxyRequest, ResponseFrame, ServerFrame},
    ClusterId, ClusterStatus, Connection, ConnectionType, Error, Fingerprint, Health,
};
use fleet_controller_registry::Registry;
use futures::prelude::*;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct Config {
    /// How long a new connection may take to present its hello.
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// A session that receives nothing for this long is closed.
    pub idle_timeout: Duration,
    /// The number of frames that may be queued for a session's writer.
    pub queue_depth: usize,
}

/// Accepts agent connections and routes requests to the session of each agent-connected cluster.
///
/// At most one session is live per cluster: a newly authenticated agent replaces the current
/// session, whose in-flight requests fail with `SessionClosed`. A session is also closed when its
/// cluster is deregistered or re-registered with a different connection.
#[derive(Clone, Debug)]
pub struct TunnelServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    registry: Registry,
    config: Config,
    metrics: TunnelMetrics,
    sessions: RwLock<HashMap<ClusterId, Session>>,
    next_session: AtomicU64,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
            queue_depth: 256,
        }
    }
}

// === impl TunnelServer ===

impl TunnelServer {
    pub fn new(registry: Registry, config: Config, metrics: TunnelMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                config,
                metrics,
                sessions: Default::default(),
                next_session: AtomicU64::new(0),
            }),
        }
    }

    /// Serves one agent connection until its session ends.
    ///
    /// The first frame must be a hello that authenticates the agent against its cluster's
    /// binding. Connections that fail the handshake are sent a rejection and closed.
    pub async fn serve<S, K>(&self, stream: S, sink: K) -> Result<(), Error>
    where
        S: Stream<Item = Result<AgentFrame, Error>> + Send + 'static,
        K: Sink<ServerFrame, Error = Error> + Send + 'static,
    {
        let mut stream = Box::pin(stream);
        let mut sink = Box::pin(sink);
        let mut changes = self.inner.registry.changes();

        let hello = match time::timeout(self.inner.config.handshake_timeout, stream.next()).await
        {
            Ok(Some(Ok(AgentFrame::Hello(hello)))) => hello,
            Ok(Some(Ok(_))) => {
                self.reject(&mut sink, "handshake", "expected hello").await;
                return Err(Error::protocol("expected hello"));
            }
            Ok(Some(Err(error))) => {
                self.reject(&mut sink, "handshake", "malformed hello").await;
                return Err(error);
            }
            Ok(None) => return Err(Error::SessionClosed),
            Err(_) => {
                self.reject(&mut sink, "timeout", "handshake timed out").await;
                return Err(Error::Timeout);
            }
        };

        let binding = match self.authenticate(&hello) {
            Ok(binding) => binding,
            Err(error) => {
                warn!(
                    cluster = %hello.cluster_id,
                    agent = %hello.agent_id,
                    "Agent failed authentication",
                );
                self.reject(&mut sink, "unauthorized", "unauthorized").await;
                return Err(error);
            }
        };

        let Hello {
            cluster_id: cluster,
            agent_id,
            ..
        } = hello;
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let (session, frames) = Session::new(
            id,
            cluster.clone(),
            agent_id,
            &self.inner.config,
            self.inner.metrics.clone(),
        );

        let prior = self
            .inner
            .sessions
            .write()
            .insert(cluster.clone(), session.clone());
        if let Some(prior) = prior {
            info!(%cluster, prior = prior.id(), session = id, "Replacing agent session");
            prior.close("replaced by a new session");
        }
        self.inner.metrics.session_opened();
        self.set_status(&cluster, ClusterStatus::Connected, None);

        session.start(
            ServerFrame::Welcome { session_id: id },
            frames,
            stream,
            sink,
            &self.inner.config,
        );
        loop {
            tokio::select! {
                _ = session.closed() => break,
                Ok(()) = changes.changed() => match self.inner.registry.get(&cluster) {
                    Ok(descriptor) if descriptor.fingerprint() == binding => {
                        // A re-registered descriptor starts without health.
                        if descriptor.last_health.is_none() {
                            self.set_status(&cluster, ClusterStatus::Connected, None);
                        }
                    }
                    _ => {
                        info!(%cluster, session = id, "Agent binding changed");
                        session.close("agent binding changed");
                    }
                },
            }
        }
        self.inner.metrics.session_closed();

        let current = {
            let mut sessions = self.inner.sessions.write();
            let current = sessions.get(&cluster).map(Session::id) == Some(id);
            if current {
                sessions.remove(&cluster);
            }
            current
        };
        let agent = self
            .inner
            .registry
            .get(&cluster)
            .is_ok_and(|d| d.connection_type() == ConnectionType::Agent);
        if current && agent {
            self.set_status(
                &cluster,
                ClusterStatus::Disconnected,
                Some("agent session closed".to_string()),
            );
        }
        Ok(())
    }

    /// Sends a request over the cluster's live session.
    pub async fn send(
        &self,
        cluster: &ClusterId,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<ResponseFrame, Error> {
        let result = match self.session(cluster) {
            Some(session) => session.send(request, timeout).await,
            None => Err(Error::SessionClosed),
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.inner.metrics.request(cluster.as_str(), outcome);
        result
    }

    pub fn session(&self, cluster: &ClusterId) -> Option<Session> {
        self.inner
            .sessions
            .read()
            .get(cluster)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    pub fn is_connected(&self, cluster: &ClusterId) -> bool {
        self.session(cluster).is_some()
    }

    /// Closes every session, e.g. on shutdown.
    pub fn close_all(&self) {
        let sessions = self
            .inner
            .sessions
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for session in sessions {
            session.close("server shutting down");
        }
    }

    /// Verifies the agent against its cluster's binding, returning the fingerprint of the
    /// descriptor it authenticated under.
    fn authenticate(&self, hello: &Hello) -> Result<Fingerprint, Error> {
        // Unknown clusters and bad credentials are indistinguishable to the agent.
        let descriptor = self
            .inner
            .registry
            .get(&hello.cluster_id)
            .map_err(|_| Error::Unauthorized)?;
        match &descriptor.connection {
            Connection::Agent(binding) if binding.verify(&hello.agent_id, &hello.token) => {
                Ok(descriptor.fingerprint())
            }
            _ => Err(Error::Unauthorized),
        }
    }

    async fn reject<K>(&self, sink: &mut K, label: &str, reason: &str)
    where
        K: Sink<ServerFrame, Error = Error> + Unpin,
    {
        self.inner.metrics.rejected(label);
        let rejected = ServerFrame::Rejected {
            reason: reason.to_string(),
        };
        if let Err(error) = sink.send(rejected).await {
            debug!(%error, "Failed to send rejection");
        }
        let _ = sink.close().await;
    }

    fn set_status(&self, cluster: &ClusterId, status: ClusterStatus, message: Option<String>) {
        let health = Health::new(status, message);
        if let Err(error) = self.inner.registry.update_health(cluster, health) {
            debug!(%error, "Failed to record session status");
        }
    }
}
