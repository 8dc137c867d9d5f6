use bytes::Bytes;
use fleet_controller_core::{
    strip_caller_credentials, strip_hop_by_hop,
    tunnel::{decode_headers, encode_headers, RequestFrame, ResponseFrame},
    Error, IMPERSONATE_USER,
};
use http::{header, HeaderValue, Method, Request};
use http_body_util::{BodyExt, Limited};
use tokio::time::{self, Duration};
use tracing::debug;

/// Executes requests forwarded by the control plane.
#[async_trait::async_trait]
pub trait Execute: Send + Sync + 'static {
    /// Always produces a response; failures are reported in the frame's `error`.
    async fn execute(&self, request: RequestFrame) -> ResponseFrame;
}

/// Executes requests against the local API server with the agent's own credentials,
/// impersonating the user each request was made for.
#[derive(Clone)]
pub struct KubeExecutor {
    client: kube::Client,
    timeout: Duration,
    max_body_bytes: usize,
}

#[async_trait::async_trait]
impl Execute for KubeExecutor {
    async fn execute(&self, request: RequestFrame) -> ResponseFrame {
        let request_id = request.request_id;
        match time::timeout(self.timeout, self.send(request)).await {
            Ok(Ok(rsp)) => rsp,
            Ok(Err(error)) => failed(request_id, error),
            Err(_) => failed(request_id, Error::Timeout),
        }
    }
}

impl KubeExecutor {
    pub fn new(client: kube::Client, timeout: Duration, max_body_bytes: usize) -> Self {
        Self {
            client,
            timeout,
            max_body_bytes,
        }
    }

    async fn send(&self, frame: RequestFrame) -> Result<ResponseFrame, Error> {
        let request_id = frame.request_id;
        let req = request(frame)?.map(kube::client::Body::from);
        debug!(request_id, method = %req.method(), path = %req.uri().path(), "Executing");
        let rsp = self
            .client
            .send(req)
            .await
            .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;

        let (mut parts, body) = rsp.into_parts();
        let body = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| Error::UpstreamUnreachable(format!("failed to read response: {e}")))?
            .to_bytes();
        strip_hop_by_hop(&mut parts.headers);
        Ok(ResponseFrame {
            request_id,
            status_code: parts.status.as_u16(),
            headers: encode_headers(&parts.headers),
            body,
            error: None,
        })
    }
}

/// Builds the request to send to the local API server.
///
/// Credentials carried by the frame are never used; the forwarded identity, if any, is
/// impersonated instead.
fn request(frame: RequestFrame) -> Result<Request<Bytes>, Error> {
    let method = Method::from_bytes(frame.method.as_bytes()).map_err(Error::protocol)?;
    let uri = match &frame.query {
        Some(query) => format!("{}?{}", frame.path, query),
        None => frame.path,
    };

    let mut headers = decode_headers(&frame.headers)?;
    strip_caller_credentials(&mut headers);
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    if let Some(identity) = &frame.identity {
        let user =
            HeaderValue::from_str(identity.impersonation_name()).map_err(Error::protocol)?;
        headers.insert(IMPERSONATE_USER, user);
    }

    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(frame.body)
        .map_err(Error::protocol)?;
    *req.headers_mut() = headers;
    Ok(req)
}

fn failed(request_id: u64, error: Error) -> ResponseFrame {
    debug!(request_id, %error, "Request failed");
    ResponseFrame {
        request_id,
        status_code: error.status_code().as_u16(),
        headers: Vec::new(),
        body: Bytes::new(),
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_controller_core::tunnel::ForwardedIdentity;

    fn frame(headers: &[(&str, &str)]) -> RequestFrame {
        RequestFrame {
            request_id: 7,
            method: "PATCH".to_string(),
            path: "/apis/apps/v1/namespaces/ns1/deployments/web".to_string(),
            query: Some("fieldManager=fleet".to_string()),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: Bytes::from_static(b"{}"),
            identity: Some(ForwardedIdentity {
                user_id: "alice".to_string(),
                email: String::new(),
            }),
        }
    }

    #[test]
    fn impersonates_the_forwarded_identity() {
        let req = request(frame(&[
            ("authorization", "Bearer leaked"),
            ("impersonate-user", "admin"),
            ("impersonate-group", "system:masters"),
            ("connection", "x-hop"),
            ("x-hop", "1"),
            ("host", "fleet.example.com"),
            ("content-type", "application/merge-patch+json"),
        ]))
        .unwrap();

        assert_eq!(req.method(), Method::PATCH);
        assert_eq!(
            req.uri(),
            "/apis/apps/v1/namespaces/ns1/deployments/web?fieldManager=fleet"
        );
        assert_eq!(req.headers()["impersonate-user"], "alice");
        assert_eq!(
            req.headers()["content-type"],
            "application/merge-patch+json"
        );
        for stripped in ["authorization", "impersonate-group", "x-hop", "host"] {
            assert!(!req.headers().contains_key(stripped), "{stripped}");
        }
        assert_eq!(req.body(), &Bytes::from_static(b"{}"));
    }

    #[test]
    fn agent_originated_requests_are_not_impersonated() {
        let mut frame = frame(&[]);
        frame.identity = None;
        let req = request(frame).unwrap();
        assert!(!req.headers().contains_key("impersonate-user"));
    }

    #[test]
    fn malformed_requests() {
        let mut bad_method = frame(&[]);
        bad_method.method = "GET /".to_string();
        assert!(matches!(request(bad_method), Err(Error::Protocol(_))));

        let bad_header = frame(&[("bad header", "x")]);
        assert!(matches!(request(bad_header), Err(Error::Protocol(_))));
    }

    #[test]
    fn failures_are_reported_in_the_frame() {
        let rsp = failed(3, Error::Timeout);
        assert_eq!(rsp.request_id, 3);
        assert_eq!(rsp.status_code, 504);
        assert_eq!(rsp.error.as_deref(), Some("request timed out"));
    }
}
