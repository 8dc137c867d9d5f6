use crate::{
    core::{
        strip_caller_credentials, strip_hop_by_hop,
        tunnel::{decode_headers, encode_headers, ForwardedIdentity, ProxyRequest},
        ClusterDescriptor, ClusterId, ClusterStatus, Connection, Error, Health, Identity,
        IMPERSONATE_USER,
    },
    registry::Registry,
    tunnel::TunnelServer,
    Body, BoxError,
};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry as Prometheus,
};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

/// Lets callers shorten the deadline of a proxied request, in seconds.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// The deadline applied to every proxied request; callers may only shorten it.
    pub max_timeout: Duration,
    pub max_body_bytes: usize,
}

/// Forwards API requests to a cluster over whichever transport reaches it.
#[derive(Clone, Debug)]
pub struct Router {
    registry: Registry,
    tunnel: TunnelServer,
    config: RouterConfig,
    metrics: ProxyMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct ProxyMetrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    transport: &'static str,
    outcome: &'static str,
}

/// The parts of a caller's request that are forwarded upstream.
struct Forward {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

// === impl Router ===

impl Router {
    pub fn new(
        registry: Registry,
        tunnel: TunnelServer,
        config: RouterConfig,
        metrics: ProxyMetrics,
    ) -> Self {
        Self {
            registry,
            tunnel,
            config,
            metrics,
        }
    }

    /// Proxies `req` to `path` on `cluster` on behalf of `identity`.
    ///
    /// Failures are returned as JSON error responses; they never affect other requests.
    pub async fn proxy<B>(
        &self,
        identity: &Identity,
        cluster: &str,
        path: String,
        req: Request<B>,
    ) -> Response<Body>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();

        let body = match Limited::new(body, self.config.max_body_bytes)
            .collect()
            .await
        {
            Ok(body) => body.to_bytes(),
            Err(error) if error.is::<LengthLimitError>() => {
                info!(%cluster, user = %identity.user_id, %method, %path, "Request body too large");
                return json_error(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format_args!(
                        "request body exceeds {} bytes",
                        self.config.max_body_bytes
                    ),
                );
            }
            Err(error) => {
                debug!(%error, "Failed to read request body");
                return json_error(
                    StatusCode::BAD_REQUEST,
                    format_args!("failed to read request body: {error}"),
                );
            }
        };

        let forward = Forward {
            method: parts.method,
            path: path.clone(),
            query: parts.uri.query().map(Into::into),
            timeout: self.timeout(&parts.headers),
            headers: parts.headers,
            body,
        };
        let result = match cluster.parse::<ClusterId>() {
            Ok(id) => self.forward(identity, &id, forward).await,
            Err(_) => Err(Error::ClusterNotFound(ClusterId::new(cluster))),
        };
        match result {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(
                    %cluster,
                    user = %identity.user_id,
                    %method,
                    %path,
                    %error,
                    "Proxy request failed",
                );
                error_response(&error)
            }
        }
    }

    async fn forward(
        &self,
        identity: &Identity,
        cluster: &ClusterId,
        forward: Forward,
    ) -> Result<Response<Body>, Error> {
        // Clusters outside the caller's scope are indistinguishable from unknown ones.
        if !identity.permissions.sees_cluster(cluster) {
            return Err(Error::ClusterNotFound(cluster.clone()));
        }
        let descriptor = self.registry.get(cluster)?;
        let transport = match descriptor.connection {
            Connection::Direct(_) => "direct",
            Connection::Agent(_) => "agent",
        };
        let result = match descriptor.connection {
            Connection::Direct(_) => self.direct(&descriptor, identity, forward).await,
            Connection::Agent(_) => self.agent(cluster, identity, forward).await,
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.metrics.requests(transport, outcome).inc();
        result
    }

    async fn direct(
        &self,
        descriptor: &ClusterDescriptor,
        identity: &Identity,
        forward: Forward,
    ) -> Result<Response<Body>, Error> {
        let client = self.registry.client(&descriptor.id).await?;

        let mut headers = forward.headers;
        strip_caller_credentials(&mut headers);
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        let user = HeaderValue::from_str(identity.impersonation_name())
            .map_err(|_| Error::Unauthorized)?;
        headers.insert(IMPERSONATE_USER, user);

        let uri = match &forward.query {
            Some(q) => format!("{}?{}", forward.path, q),
            None => forward.path,
        };
        let mut req = Request::builder()
            .method(forward.method)
            .uri(uri)
            .body(kube::client::Body::from(forward.body))
            .map_err(Error::protocol)?;
        *req.headers_mut() = headers;

        let rsp = match time::timeout(forward.timeout, client.send(req)).await {
            Ok(Ok(rsp)) => rsp,
            Ok(Err(error)) => {
                let error = Error::UpstreamUnreachable(error.to_string());
                self.downgrade(&descriptor.id, &error);
                return Err(error);
            }
            Err(_) => {
                self.downgrade(&descriptor.id, &Error::Timeout);
                return Err(Error::Timeout);
            }
        };

        let (mut parts, body) = rsp.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(
            parts,
            body.map_err(BoxError::from).boxed_unsync(),
        ))
    }

    async fn agent(
        &self,
        cluster: &ClusterId,
        identity: &Identity,
        forward: Forward,
    ) -> Result<Response<Body>, Error> {
        let mut headers = forward.headers;
        strip_caller_credentials(&mut headers);
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        let request = ProxyRequest {
            method: forward.method.to_string(),
            path: forward.path,
            query: forward.query,
            headers: encode_headers(&headers),
            body: forward.body,
            identity: Some(ForwardedIdentity::from(identity)),
        };
        let rsp = self.tunnel.send(cluster, request, forward.timeout).await?;

        let status = StatusCode::from_u16(rsp.status_code).map_err(|_| {
            Error::protocol(format_args!("invalid status code {}", rsp.status_code))
        })?;
        let mut headers = decode_headers(&rsp.headers)?;
        strip_hop_by_hop(&mut headers);
        let mut response = Response::new(full(rsp.body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Health is advisory; a failed request marks a cluster unhealthy until its next health
    /// check succeeds.
    fn downgrade(&self, cluster: &ClusterId, error: &Error) {
        let health = Health::new(ClusterStatus::Unhealthy, Some(error.to_string()));
        let _ = self.registry.update_health(cluster, health);
    }

    fn timeout(&self, headers: &HeaderMap) -> Duration {
        headers
            .get(REQUEST_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|d| !d.is_zero())
            .map_or(self.config.max_timeout, |d| d.min(self.config.max_timeout))
    }
}

// === impl ProxyMetrics ===

impl ProxyMetrics {
    pub fn register(prom: &mut Prometheus) -> Self {
        let requests = Family::default();
        prom.register(
            "requests",
            "Count of proxied requests by transport and outcome",
            requests.clone(),
        );
        Self { requests }
    }

    fn requests(&self, transport: &'static str, outcome: &'static str) -> Counter {
        self.requests
            .get_or_create(&RequestLabels { transport, outcome })
            .clone()
    }
}

pub(crate) fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub(crate) fn json_error(status: StatusCode, error: impl std::fmt::Display) -> Response<Body> {
    let body = serde_json::json!({ "error": error.to_string() });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full(body.to_string()))
        .expect("error response must be valid")
}

pub(crate) fn error_response(error: &Error) -> Response<Body> {
    json_error(error.status_code(), error)
}
