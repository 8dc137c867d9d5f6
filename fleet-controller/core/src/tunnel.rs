//! Frames exchanged between the control plane and an in-cluster agent.
//!
//! Frames are JSON objects tagged by `type`. Bodies are base64 encoded and headers are an ordered
//! list of `[name, value]` pairs so that repeated headers survive the trip unchanged. Header
//! values are read as ISO-8859-1, one character per byte, so any value round-trips exactly and
//! ASCII values read as themselves.

use crate::{ClusterId, Error, Identity};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Headers = Vec<(String, String)>;

/// Frames sent by an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentFrame {
    Hello(Hello),
    Response(ResponseFrame),
    Pong,
}

/// Frames sent by the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome { session_id: u64 },
    Rejected { reason: String },
    Request(RequestFrame),
    Cancel { request_id: u64 },
    Ping,
}

/// The one-time handshake that authenticates an agent stream.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub cluster_id: ClusterId,
    pub agent_id: String,
    pub token: String,
}

/// An HTTP request to be executed by an agent on behalf of the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub request_id: u64,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
    /// The user on whose behalf the request is made. Absent for requests originated by the
    /// control plane itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ForwardedIdentity>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub request_id: u64,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
    /// Set when the agent could not obtain a response from its API server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedIdentity {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
}

/// A request to be sent over a tunnel; the session assigns its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
    pub identity: Option<ForwardedIdentity>,
}

// === impl Hello ===

impl fmt::Debug for Hello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hello")
            .field("cluster_id", &self.cluster_id)
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

// === impl ProxyRequest ===

impl ProxyRequest {
    pub fn into_frame(self, request_id: u64) -> RequestFrame {
        let Self {
            method,
            path,
            query,
            headers,
            body,
            identity,
        } = self;
        RequestFrame {
            request_id,
            method,
            path,
            query,
            headers,
            body,
            identity,
        }
    }
}

// === impl RequestFrame ===

impl RequestFrame {
    /// The request path including its query string.
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

// === impl ResponseFrame ===

impl ResponseFrame {
    pub fn failed(request_id: u64, error: impl fmt::Display) -> Self {
        Self {
            request_id,
            status_code: http::StatusCode::BAD_GATEWAY.as_u16(),
            headers: Headers::new(),
            body: Bytes::new(),
            error: Some(error.to_string()),
        }
    }
}

// === impl ForwardedIdentity ===

impl From<&Identity> for ForwardedIdentity {
    fn from(id: &Identity) -> Self {
        Self {
            user_id: id.user_id.clone(),
            email: id.email.clone(),
        }
    }
}

impl ForwardedIdentity {
    pub fn impersonation_name(&self) -> &str {
        if self.email.is_empty() {
            &self.user_id
        } else {
            &self.email
        }
    }
}

/// Copies a header map into frame headers, preserving order.
pub fn encode_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .map(|(name, value)| {
            let value = value.as_bytes().iter().map(|&b| char::from(b)).collect();
            (name.as_str().to_string(), value)
        })
        .collect()
}

pub fn decode_headers(headers: &Headers) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::protocol(format_args!("invalid header name {name:?}: {e}")))?;
        let bytes = value
            .chars()
            .map(u8::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::protocol(format_args!("invalid value for header {name}: {e}")))?;
        let value = HeaderValue::from_bytes(&bytes)
            .map_err(|e| Error::protocol(format_args!("invalid value for header {name}: {e}")))?;
        map.append(name, value);
    }
    Ok(map)
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let frame = ServerFrame::Request(RequestFrame {
            request_id: 7,
            method: "POST".into(),
            path: "/api/v1/namespaces/ns1/configmaps".into(),
            query: Some("dryRun=All".into()),
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from_static(b"{}"),
            identity: Some(ForwardedIdentity {
                user_id: "u-1".into(),
                email: "alice@example.com".into(),
            }),
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "request",
                "requestId": 7,
                "method": "POST",
                "path": "/api/v1/namespaces/ns1/configmaps",
                "query": "dryRun=All",
                "headers": [["content-type", "application/json"]],
                "body": "e30=",
                "identity": {"userId": "u-1", "email": "alice@example.com"},
            })
        );
    }

    #[test]
    fn control_frames() {
        assert_eq!(
            serde_json::to_value(ServerFrame::Cancel { request_id: 3 }).unwrap(),
            json!({"type": "cancel", "requestId": 3})
        );
        assert_eq!(
            serde_json::to_value(ServerFrame::Welcome { session_id: 1 }).unwrap(),
            json!({"type": "welcome", "sessionId": 1})
        );
        let pong: AgentFrame = serde_json::from_value(json!({"type": "pong"})).unwrap();
        assert_eq!(pong, AgentFrame::Pong);
    }

    #[test]
    fn response_body_is_binary_safe() {
        let body = Bytes::from_static(&[0, 159, 146, 150, 255]);
        let frame = AgentFrame::Response(ResponseFrame {
            request_id: 1,
            status_code: 200,
            headers: vec![],
            body: body.clone(),
            error: None,
        });
        let text = serde_json::to_string(&frame).unwrap();
        match serde_json::from_str::<AgentFrame>(&text).unwrap() {
            AgentFrame::Response(rsp) => assert_eq!(rsp.body, body),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn hello_hides_token() {
        let hello: AgentFrame = serde_json::from_value(json!({
            "type": "hello",
            "clusterId": "edge-1",
            "agentId": "a",
            "token": "hunter2",
        }))
        .unwrap();
        assert!(!format!("{hello:?}").contains("hunter2"));
    }

    #[test]
    fn repeated_headers_keep_order() {
        let mut map = HeaderMap::new();
        map.append("accept", HeaderValue::from_static("application/json"));
        map.append("accept", HeaderValue::from_static("application/yaml"));
        map.append("x-one", HeaderValue::from_static("1"));
        let encoded = encode_headers(&map);
        let decoded = decode_headers(&encoded).unwrap();
        let accepts = decoded
            .get_all("accept")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(accepts, vec!["application/json", "application/yaml"]);
        assert!(decode_headers(&vec![("bad header".into(), "x".into())]).is_err());
    }

    #[test]
    fn header_values_are_carried_byte_for_byte() {
        let mut map = HeaderMap::new();
        map.append("x-name", HeaderValue::from_bytes(b"caf\xc3\xa9").unwrap());
        map.append("x-latin", HeaderValue::from_bytes(b"\xe9t\xe9").unwrap());
        map.append("x-plain", HeaderValue::from_static("ok"));

        let encoded = encode_headers(&map);
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded[2], ("x-plain".to_string(), "ok".to_string()));

        // Through JSON, as frames travel.
        let json = serde_json::to_string(&encoded).unwrap();
        let decoded = decode_headers(&serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(decoded["x-name"].as_bytes(), b"caf\xc3\xa9");

        // Characters beyond a single byte cannot have come from a header.
        assert!(decode_headers(&vec![("x-name".into(), "caf\u{e9}\u{2603}".into())]).is_err());
    }
}
