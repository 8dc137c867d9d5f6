use crate::{Config, TunnelMetrics, TunnelServer};
use bytes::Bytes;
use fleet_controller_core::{
    tunnel::{
        AgentFrame, ForwardedIdentity, Hello, ProxyRequest, RequestFrame, ResponseFrame,
        ServerFrame,
    },
    AgentBinding, ClusterDescriptor, ClusterId, ClusterStatus, Credentials, Error,
};
use fleet_controller_registry::{ClientFactory, Registry};
use futures::{channel::mpsc as chan, prelude::*};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Duration},
};
use tokio_stream::wrappers::ReceiverStream;

const EDGE: &str = "edge";

struct Fixture {
    registry: Registry,
    server: TunnelServer,
    metrics: TunnelMetrics,
}

/// The agent's end of an in-memory connection.
struct Agent {
    tx: mpsc::Sender<Result<AgentFrame, Error>>,
    rx: chan::Receiver<ServerFrame>,
}

impl Fixture {
    fn new() -> Self {
        let registry = Registry::new(ClientFactory::new(None, Duration::from_secs(1)));
        registry.register(ClusterDescriptor::agent(
            ClusterId::new(EDGE),
            AgentBinding::new("agent-1", "s3cret"),
        ));
        registry.register(ClusterDescriptor::direct(
            ClusterId::new("hub"),
            Credentials::InCluster,
        ));
        let metrics = TunnelMetrics::default();
        let server = TunnelServer::new(registry.clone(), Config::default(), metrics.clone());
        Self {
            registry,
            server,
            metrics,
        }
    }

    fn connect(&self) -> (Agent, JoinHandle<Result<(), Error>>) {
        let (agent_tx, server_rx) = mpsc::channel(64);
        let (server_tx, agent_rx) = chan::channel(64);
        let server = self.server.clone();
        let task = tokio::spawn(async move {
            let sink = server_tx.sink_map_err(|_| Error::SessionClosed);
            server.serve(ReceiverStream::new(server_rx), sink).await
        });
        let agent = Agent {
            tx: agent_tx,
            rx: agent_rx,
        };
        (agent, task)
    }

    /// Connects an agent and completes the handshake.
    async fn session(&self) -> (Agent, JoinHandle<Result<(), Error>>) {
        let (mut agent, task) = self.connect();
        match agent.hello(EDGE, "agent-1", "s3cret").await {
            ServerFrame::Welcome { .. } => {}
            frame => panic!("unexpected frame: {frame:?}"),
        }
        (agent, task)
    }

    fn status(&self) -> ClusterStatus {
        self.registry
            .get(&ClusterId::new(EDGE))
            .expect("cluster must be registered")
            .status
    }

    fn send(&self, path: &str, timeout: Duration) -> JoinHandle<Result<ResponseFrame, Error>> {
        let server = self.server.clone();
        let request = get(path);
        tokio::spawn(async move {
            server
                .send(&ClusterId::new(EDGE), request, timeout)
                .await
        })
    }
}

impl Agent {
    async fn hello(&mut self, cluster: &str, agent_id: &str, token: &str) -> ServerFrame {
        self.tx
            .send(Ok(AgentFrame::Hello(Hello {
                cluster_id: ClusterId::new(cluster),
                agent_id: agent_id.to_string(),
                token: token.to_string(),
            })))
            .await
            .expect("server must be reading");
        self.recv().await.expect("server must reply to hello")
    }

    /// Receives the next frame that is not a heartbeat.
    async fn recv(&mut self) -> Option<ServerFrame> {
        loop {
            match self.rx.next().await? {
                ServerFrame::Ping => continue,
                frame => return Some(frame),
            }
        }
    }

    async fn request(&mut self) -> RequestFrame {
        match self.recv().await {
            Some(ServerFrame::Request(req)) => req,
            frame => panic!("expected a request, got {frame:?}"),
        }
    }

    async fn respond(&self, request_id: u64, body: impl Into<Bytes>) {
        let rsp = ResponseFrame {
            request_id,
            status_code: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: body.into(),
            error: None,
        };
        self.tx
            .send(Ok(AgentFrame::Response(rsp)))
            .await
            .expect("server must be reading");
    }
}

fn get(path: &str) -> ProxyRequest {
    ProxyRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        query: None,
        headers: vec![],
        body: Bytes::new(),
        identity: Some(ForwardedIdentity {
            user_id: "u-1".to_string(),
            email: "alice@example.com".to_string(),
        }),
    }
}

#[tokio::test]
async fn round_trip() {
    let fx = Fixture::new();
    assert_eq!(fx.status(), ClusterStatus::Disconnected);

    let (mut agent, _task) = fx.session().await;
    assert_eq!(fx.status(), ClusterStatus::Connected);
    assert!(fx.server.is_connected(&ClusterId::new(EDGE)));

    let rsp = fx.send("/api/v1/namespaces", Duration::from_secs(5));
    let req = agent.request().await;
    assert_eq!(req.method, "GET");
    assert_eq!(req.path, "/api/v1/namespaces");
    assert_eq!(
        req.identity.as_ref().map(|i| i.impersonation_name()),
        Some("alice@example.com")
    );
    agent.respond(req.request_id, "ok").await;

    let rsp = rsp.await.unwrap().expect("request must succeed");
    assert_eq!(rsp.status_code, 200);
    assert_eq!(rsp.body, Bytes::from_static(b"ok"));
}

#[tokio::test]
async fn rejects_bad_credentials() {
    let fx = Fixture::new();
    for (cluster, agent_id, token) in [
        (EDGE, "agent-1", "wrong"),
        (EDGE, "agent-2", "s3cret"),
        ("hub", "agent-1", "s3cret"),
        ("unknown", "agent-1", "s3cret"),
    ] {
        let (mut agent, task) = fx.connect();
        assert_eq!(
            agent.hello(cluster, agent_id, token).await,
            ServerFrame::Rejected {
                reason: "unauthorized".to_string()
            }
        );
        assert_eq!(task.await.unwrap(), Err(Error::Unauthorized));
    }
    assert!(!fx.server.is_connected(&ClusterId::new(EDGE)));
    assert_eq!(fx.status(), ClusterStatus::Disconnected);
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let fx = Fixture::new();
    let (mut agent, task) = fx.connect();
    agent.tx.send(Ok(AgentFrame::Pong)).await.unwrap();
    assert!(matches!(
        agent.recv().await,
        Some(ServerFrame::Rejected { .. })
    ));
    assert!(matches!(task.await.unwrap(), Err(Error::Protocol(_))));
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out() {
    let fx = Fixture::new();
    let (mut agent, task) = fx.connect();
    assert_eq!(task.await.unwrap(), Err(Error::Timeout));
    assert!(matches!(
        agent.recv().await,
        Some(ServerFrame::Rejected { .. })
    ));
}

#[tokio::test]
async fn correlates_concurrent_requests() {
    let fx = Fixture::new();
    let (mut agent, _task) = fx.session().await;

    let calls = (0..20)
        .map(|i| {
            let path = format!("/api/v1/namespaces/ns-{i}");
            (path.clone(), fx.send(&path, Duration::from_secs(5)))
        })
        .collect::<Vec<_>>();

    let mut requests = Vec::new();
    for _ in 0..calls.len() {
        requests.push(agent.request().await);
    }
    let mut ids = requests.iter().map(|r| r.request_id).collect::<Vec<_>>();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), calls.len(), "request ids must be unique");

    // Answer in the opposite order from which requests arrived.
    for req in requests.iter().rev() {
        agent.respond(req.request_id, req.path.clone()).await;
    }

    for (path, call) in calls {
        let rsp = call.await.unwrap().expect("request must succeed");
        assert_eq!(rsp.body, Bytes::from(path));
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_cancels_request() {
    let fx = Fixture::new();
    let (mut agent, _task) = fx.session().await;

    let call = fx.send("/slow", Duration::from_secs(1));
    let req = agent.request().await;
    assert_eq!(call.await.unwrap().unwrap_err(), Error::Timeout);
    assert_eq!(
        agent.recv().await,
        Some(ServerFrame::Cancel {
            request_id: req.request_id
        })
    );

    // A response that arrives after the caller gave up is dropped.
    agent.respond(req.request_id, "late").await;
    let call = fx.send("/next", Duration::from_secs(5));
    let next = agent.request().await;
    agent.respond(next.request_id, "next").await;
    let rsp = call.await.unwrap().expect("request must succeed");
    assert_eq!(rsp.body, Bytes::from_static(b"next"));
    assert_eq!(fx.metrics.stale_responses(), 1);
}

#[tokio::test]
async fn agent_errors_are_surfaced() {
    let fx = Fixture::new();
    let (mut agent, _task) = fx.session().await;

    let call = fx.send("/version", Duration::from_secs(5));
    let req = agent.request().await;
    agent
        .tx
        .send(Ok(AgentFrame::Response(ResponseFrame::failed(
            req.request_id,
            "connection refused",
        ))))
        .await
        .unwrap();
    assert_eq!(
        call.await.unwrap().unwrap_err(),
        Error::UpstreamUnreachable("connection refused".to_string())
    );
}

#[tokio::test]
async fn teardown_fails_pending_requests() {
    let fx = Fixture::new();
    let (mut agent, task) = fx.session().await;

    let calls = (0..3)
        .map(|i| fx.send(&format!("/r{i}"), Duration::from_secs(30)))
        .collect::<Vec<_>>();
    for _ in 0..calls.len() {
        agent.request().await;
    }

    drop(agent.tx);
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap_err(), Error::SessionClosed);
    }
    task.await.unwrap().expect("session must end cleanly");
    assert_eq!(fx.status(), ClusterStatus::Disconnected);

    let call = fx.send("/after", Duration::from_secs(1));
    assert_eq!(call.await.unwrap().unwrap_err(), Error::SessionClosed);
}

#[tokio::test]
async fn no_session() {
    let fx = Fixture::new();
    let call = fx.send("/version", Duration::from_secs(1));
    assert_eq!(call.await.unwrap().unwrap_err(), Error::SessionClosed);
}

#[tokio::test]
async fn new_agent_replaces_session() {
    let fx = Fixture::new();
    let (mut first, first_task) = fx.session().await;
    let pending = fx.send("/pending", Duration::from_secs(30));
    first.request().await;

    let (mut second, _second_task) = fx.connect();
    assert_eq!(
        second.hello(EDGE, "agent-1", "s3cret").await,
        ServerFrame::Welcome { session_id: 2 }
    );

    assert_eq!(pending.await.unwrap().unwrap_err(), Error::SessionClosed);
    first_task.await.unwrap().expect("replaced session must end cleanly");
    assert_eq!(first.recv().await, None);
    assert_eq!(fx.status(), ClusterStatus::Connected);

    let call = fx.send("/next", Duration::from_secs(5));
    let req = second.request().await;
    second.respond(req.request_id, "second").await;
    let rsp = call.await.unwrap().expect("request must succeed");
    assert_eq!(rsp.body, Bytes::from_static(b"second"));
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_are_closed() {
    let fx = Fixture::new();
    let (_agent, task) = fx.session().await;

    // The agent never answers heartbeats.
    task.await.unwrap().expect("session must end cleanly");
    assert_eq!(fx.status(), ClusterStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_keep_sessions_open() {
    let fx = Fixture::new();
    let (agent, _task) = fx.session().await;

    let Agent { tx, mut rx } = agent;
    tokio::spawn(async move {
        while let Some(frame) = rx.next().await {
            if frame == ServerFrame::Ping && tx.send(Ok(AgentFrame::Pong)).await.is_err() {
                return;
            }
        }
    });

    time::sleep(Duration::from_secs(300)).await;
    assert!(fx.server.is_connected(&ClusterId::new(EDGE)));
    assert_eq!(fx.status(), ClusterStatus::Connected);
}

#[tokio::test]
async fn close_all_ends_sessions() {
    let fx = Fixture::new();
    let (_agent, task) = fx.session().await;
    fx.server.close_all();
    task.await.unwrap().expect("session must end cleanly");
    assert!(!fx.server.is_connected(&ClusterId::new(EDGE)));
}

#[tokio::test]
async fn rebinding_closes_sessions() {
    let fx = Fixture::new();
    let (mut agent, task) = fx.session().await;
    let pending = fx.send("/pending", Duration::from_secs(30));
    agent.request().await;

    fx.registry.register(ClusterDescriptor::agent(
        ClusterId::new(EDGE),
        AgentBinding::new("agent-1", "rotated"),
    ));
    assert_eq!(pending.await.unwrap().unwrap_err(), Error::SessionClosed);
    task.await.unwrap().expect("session must end cleanly");
    assert_eq!(agent.recv().await, None);
    assert!(!fx.server.is_connected(&ClusterId::new(EDGE)));
    assert_eq!(fx.status(), ClusterStatus::Disconnected);

    // The old token no longer authenticates.
    let (mut stale, _task) = fx.connect();
    assert!(matches!(
        stale.hello(EDGE, "agent-1", "s3cret").await,
        ServerFrame::Rejected { .. }
    ));
}

#[tokio::test]
async fn switching_to_direct_closes_sessions() {
    let fx = Fixture::new();
    let (_agent, task) = fx.session().await;

    fx.registry.register(ClusterDescriptor::direct(
        ClusterId::new(EDGE),
        Credentials::InCluster,
    ));
    task.await.unwrap().expect("session must end cleanly");
    assert!(!fx.server.is_connected(&ClusterId::new(EDGE)));
    // Direct clusters' status follows their health checks, not the closed session.
    assert_eq!(fx.status(), ClusterStatus::Unknown);
}

#[tokio::test]
async fn deregistering_closes_sessions() {
    let fx = Fixture::new();
    let (_agent, task) = fx.session().await;
    fx.registry.deregister(&ClusterId::new(EDGE)).unwrap();
    task.await.unwrap().expect("session must end cleanly");
    assert!(!fx.server.is_connected(&ClusterId::new(EDGE)));
}

#[tokio::test]
async fn unchanged_bindings_keep_sessions() {
    let fx = Fixture::new();
    let (mut agent, _task) = fx.session().await;

    fx.registry.register(ClusterDescriptor::agent(
        ClusterId::new(EDGE),
        AgentBinding::new("agent-1", "s3cret"),
    ));
    // Unrelated clusters do not disturb the session either.
    fx.registry.deregister(&ClusterId::new("hub")).unwrap();

    let call = fx.send("/version", Duration::from_secs(5));
    let req = agent.request().await;
    agent.respond(req.request_id, "ok").await;
    call.await.unwrap().expect("request must succeed");
    assert_eq!(fx.status(), ClusterStatus::Connected);
}
