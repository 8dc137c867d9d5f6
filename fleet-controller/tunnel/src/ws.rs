//! WebSocket plumbing shared by the agent tunnel and the watch channel.
//!
//! Connections are accepted by upgrading a hyper request; messages are JSON text frames that are
//! decoded into typed frames on the way in and encoded on the way out.

use fleet_controller_core::Error;
use futures::prelude::*;
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    tungstenite::{handshake::derive_accept_key, protocol::Role, Message},
    WebSocketStream,
};

pub type ServerStream = WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>;

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("expected a websocket upgrade request")]
    NotUpgrade,

    #[error("unsupported websocket version")]
    Version,

    #[error("missing sec-websocket-key header")]
    MissingKey,
}

/// Returns true if the request asks to be upgraded to a WebSocket.
pub fn is_upgrade<B>(req: &Request<B>) -> bool {
    header_contains(req.headers(), header::CONNECTION, "upgrade")
        && header_contains(req.headers(), header::UPGRADE, "websocket")
}

/// Validates a WebSocket upgrade request.
///
/// Returns the `101 Switching Protocols` response to send and a future that resolves to the
/// server side of the connection once the response has been written.
pub fn upgrade<B>(
    req: &mut Request<B>,
) -> Result<
    (
        Response<()>,
        impl Future<Output = Result<ServerStream, hyper::Error>> + Send + 'static,
    ),
    UpgradeError,
> {
    if req.method() != http::Method::GET || !is_upgrade(req) {
        return Err(UpgradeError::NotUpgrade);
    }
    if req.headers().get(header::SEC_WEBSOCKET_VERSION) != Some(&HeaderValue::from_static("13")) {
        return Err(UpgradeError::Version);
    }
    let accept = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
        .ok_or(UpgradeError::MissingKey)?;

    let on_upgrade = hyper::upgrade::on(req);
    let rsp = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(())
        .expect("upgrade response must be valid");

    let upgraded = async move {
        let io = TokioIo::new(on_upgrade.await?);
        Ok(WebSocketStream::from_raw_socket(io, Role::Server, None).await)
    };
    Ok((rsp, upgraded))
}

/// Splits a WebSocket into a stream of decoded frames and a sink of frames to encode.
///
/// Control messages are handled by the WebSocket itself and never surface. A message that does
/// not decode is yielded as a protocol error so that callers can decide whether it is fatal.
pub fn frames<S, In, Out>(
    ws: WebSocketStream<S>,
) -> (
    impl Stream<Item = Result<In, Error>> + Send + 'static,
    impl Sink<Out, Error = Error> + Send + 'static,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    let (sink, stream) = ws.split();

    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(serde_json::from_str(&text).map_err(Error::protocol)),
            Ok(Message::Binary(data)) => {
                Some(serde_json::from_slice(&data).map_err(Error::protocol))
            }
            Ok(_) => None,
            Err(error) => Some(Err(Error::protocol(error))),
        })
    });

    let sink = sink
        .sink_map_err(Error::protocol)
        .with(|frame: Out| {
            future::ready(
                serde_json::to_string(&frame)
                    .map(Message::text)
                    .map_err(Error::protocol),
            )
        });

    (stream, sink)
}

fn header_contains(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_controller_core::tunnel::{AgentFrame, ServerFrame};

    fn upgrade_request() -> Request<()> {
        Request::get("/api/agent/connect")
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap()
    }

    #[test]
    fn accepts_upgrades() {
        let mut req = upgrade_request();
        let (rsp, _upgraded) = upgrade(&mut req).expect("upgrade must be accepted");
        assert_eq!(rsp.status(), StatusCode::SWITCHING_PROTOCOLS);
        // The example handshake from RFC 6455.
        assert_eq!(
            rsp.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn rejects_plain_requests() {
        let mut req = Request::get("/api/agent/connect").body(()).unwrap();
        assert!(matches!(upgrade(&mut req), Err(UpgradeError::NotUpgrade)));

        let mut req = upgrade_request();
        req.headers_mut()
            .insert("sec-websocket-version", HeaderValue::from_static("8"));
        assert!(matches!(upgrade(&mut req), Err(UpgradeError::Version)));

        let mut req = upgrade_request();
        req.headers_mut().remove("sec-websocket-key");
        assert!(matches!(upgrade(&mut req), Err(UpgradeError::MissingKey)));
    }

    #[tokio::test]
    async fn typed_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;

        let (agent_rx, agent_tx) = frames::<_, ServerFrame, AgentFrame>(client);
        let (server_rx, server_tx) = frames::<_, AgentFrame, ServerFrame>(server);
        tokio::pin!(agent_rx, agent_tx, server_rx, server_tx);

        server_tx.send(ServerFrame::Ping).await.unwrap();
        assert_eq!(agent_rx.next().await.unwrap().unwrap(), ServerFrame::Ping);

        agent_tx.send(AgentFrame::Pong).await.unwrap();
        assert_eq!(server_rx.next().await.unwrap().unwrap(), AgentFrame::Pong);
    }

    #[tokio::test]
    async fn undecodable_messages_are_protocol_errors() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let (server_rx, _server_tx) = frames::<_, AgentFrame, ServerFrame>(server);
        tokio::pin!(server_rx);

        client.send(Message::text("{\"type\":\"bogus\"}")).await.unwrap();
        client.send(Message::Ping(Default::default())).await.unwrap();
        client.send(Message::text("{\"type\":\"pong\"}")).await.unwrap();

        let err = server_rx.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
        assert_eq!(server_rx.next().await.unwrap().unwrap(), AgentFrame::Pong);
    }
}
