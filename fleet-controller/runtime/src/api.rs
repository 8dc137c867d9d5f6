use crate::{
    auth::Identities,
    core::{
        tunnel::{AgentFrame, ServerFrame},
        ClusterId, ClusterStatus, ConnectionType, Error, Health,
    },
    hub::Hub,
    proxy::{error_response, full, json_error, Router},
    registry::Registry,
    socket,
    tunnel::{ws, TunnelServer},
    Body, BoxError,
};
use bytes::Bytes;
use futures::future;
use http::{header, Method, Request, Response, StatusCode};
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, task};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, instrument, Instrument};

/// Serves the control plane's HTTP API.
///
/// | Route                                     | Purpose                          |
/// |-------------------------------------------|----------------------------------|
/// | `ANY /api/proxy/k8s/{cluster}/{path...}`  | reverse proxy to a cluster       |
/// | `GET /api/watch/{cluster}`                | watch channel (WebSocket)        |
/// | `GET /api/agent/connect`                  | agent tunnel (WebSocket)         |
/// | `GET /api/clusters`                       | cluster listing                  |
#[derive(Clone, Debug)]
pub struct Api {
    registry: Registry,
    identities: Identities,
    router: Router,
    tunnel: TunnelServer,
    hub: Hub,
    drain: drain::Watch,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSummary<'a> {
    id: &'a ClusterId,
    connection_type: ConnectionType,
    status: ClusterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_health: Option<&'a Health>,
}

// === impl Api ===

impl Api {
    pub fn new(
        registry: Registry,
        identities: Identities,
        router: Router,
        tunnel: TunnelServer,
        hub: Hub,
        drain: drain::Watch,
    ) -> Self {
        Self {
            registry,
            identities,
            router,
            tunnel,
            hub,
            drain,
        }
    }

    async fn route<B>(self, req: Request<B>) -> Response<Body>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();

        if let Some(rest) = path.strip_prefix("/api/proxy/k8s/") {
            let (cluster, upstream) = rest.split_once('/').unwrap_or((rest, ""));
            let identity = match self.identities.authenticate(&req, false) {
                Ok(identity) => identity,
                Err(error) => return error_response(&error),
            };
            return self
                .router
                .proxy(&identity, cluster, format!("/{upstream}"), req)
                .await;
        }

        if let Some(cluster) = path.strip_prefix("/api/watch/") {
            if req.method() != Method::GET {
                return method_not_allowed();
            }
            return self.watch(cluster, req);
        }

        match path.as_str() {
            "/api/agent/connect" if req.method() == Method::GET => self.connect(req),
            "/api/clusters" if req.method() == Method::GET => self.clusters(&req),
            "/api/agent/connect" | "/api/clusters" => method_not_allowed(),
            _ => json_error(StatusCode::NOT_FOUND, "not found"),
        }
    }

    fn clusters<B>(&self, req: &Request<B>) -> Response<Body> {
        let identity = match self.identities.authenticate(req, false) {
            Ok(identity) => identity,
            Err(error) => return error_response(&error),
        };
        let clusters = self.registry.list();
        let visible = clusters
            .iter()
            .filter(|c| identity.permissions.sees_cluster(&c.id))
            .map(|c| ClusterSummary {
                id: &c.id,
                connection_type: c.connection_type(),
                status: c.status,
                last_health: c.last_health.as_ref(),
            })
            .collect::<Vec<_>>();
        match serde_json::to_vec(&visible) {
            Ok(body) => Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .body(full(body))
                .expect("cluster listing response must be valid"),
            Err(error) => json_error(StatusCode::INTERNAL_SERVER_ERROR, error),
        }
    }

    fn watch<B>(&self, cluster: &str, mut req: Request<B>) -> Response<Body> {
        let identity = match self.identities.authenticate(&req, true) {
            Ok(identity) => identity,
            Err(error) => return error_response(&error),
        };
        let cluster = match cluster.parse::<ClusterId>() {
            Ok(cluster) => cluster,
            Err(_) => return error_response(&Error::ClusterNotFound(ClusterId::new(cluster))),
        };
        if !identity.permissions.sees_cluster(&cluster) {
            return error_response(&Error::ClusterNotFound(cluster));
        }
        if let Err(error) = self.registry.get(&cluster) {
            return error_response(&error);
        }
        let (rsp, upgraded) = match ws::upgrade(&mut req) {
            Ok(upgrade) => upgrade,
            Err(error) => return json_error(StatusCode::BAD_REQUEST, error),
        };

        let span = info_span!("watch_channel", %cluster, user = %identity.user_id);
        let (subscriber, queue) = self.hub.subscriber(cluster, identity);
        let drain = self.drain.clone();
        tokio::spawn(
            async move {
                match upgraded.await {
                    Ok(socket) => socket::serve(socket, subscriber, queue, drain).await,
                    Err(error) => debug!(%error, "Watch channel upgrade failed"),
                }
                debug!("Watch channel closed");
            }
            .instrument(span),
        );
        rsp.map(|()| Body::default())
    }

    fn connect<B>(&self, mut req: Request<B>) -> Response<Body> {
        let (rsp, upgraded) = match ws::upgrade(&mut req) {
            Ok(upgrade) => upgrade,
            Err(error) => return json_error(StatusCode::BAD_REQUEST, error),
        };
        let tunnel = self.tunnel.clone();
        tokio::spawn(
            async move {
                let socket = match upgraded.await {
                    Ok(socket) => socket,
                    Err(error) => {
                        debug!(%error, "Agent upgrade failed");
                        return;
                    }
                };
                let (frames, sink) = ws::frames::<_, AgentFrame, ServerFrame>(socket);
                match tunnel.serve(frames, sink).await {
                    Ok(()) => debug!("Agent disconnected"),
                    Err(error) => info!(%error, "Agent connection failed"),
                }
            }
            .instrument(info_span!("agent")),
        );
        rsp.map(|()| Body::default())
    }
}

impl<B> tower::Service<Request<B>> for Api
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Infallible>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let api = self.clone();
        Box::pin(async move { Ok(api.route(req).await) })
    }
}

fn method_not_allowed() -> Response<Body> {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

/// Accepts API connections until shutdown is signaled.
#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn serve(addr: SocketAddr, api: Api, drain: drain::Watch) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    accept(listener, api, drain).await;
    Ok(())
}

async fn accept(listener: TcpListener, api: Api, drain: drain::Watch) {
    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        let (io, client) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(error) => {
                    info!(%error, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => {
                debug!("No longer accepting connections");
                return;
            }
        };

        let api = api.clone();
        let drain = drain.clone();
        tokio::spawn(
            async move {
                let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                    tower::Service::call(&mut api.clone(), req)
                });
                let conn = http1::Builder::new()
                    .serve_connection(TokioIo::new(io), service)
                    .with_upgrades();
                tokio::pin!(conn);
                let res = tokio::select! {
                    res = &mut conn => res,
                    handle = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        handle.release_after(async move { conn.await }).await
                    }
                };
                if let Err(error) = res {
                    debug!(%error, "Connection failed");
                }
            }
            .instrument(info_span!("conn", %client)),
        );
    }
}
