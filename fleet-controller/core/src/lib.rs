#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backoff;
pub mod cluster;
mod error;
pub mod identity;
pub mod subscription;
pub mod tunnel;

pub use self::{
    backoff::Backoff,
    cluster::{
        AgentBinding, ClusterDescriptor, ClusterId, ClusterStatus, Connection, ConnectionType,
        Credentials, Fingerprint, Health,
    },
    error::Error,
    identity::{Identity, Rule, Scope},
    subscription::{EventType, ResourceRef, WatchSubscription},
};

/// The header used to impersonate the calling user at an upstream API server.
pub const IMPERSONATE_USER: &str = "impersonate-user";

/// Headers that are meaningful only for a single transport hop and must not be forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any header named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut http::HeaderMap) {
    let named = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_ascii_lowercase())
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>();
    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Removes credentials and impersonation directives supplied by a caller.
pub fn strip_caller_credentials(headers: &mut http::HeaderMap) {
    headers.remove(http::header::AUTHORIZATION);
    let impersonation = headers
        .keys()
        .filter(|k| k.as_str().starts_with("impersonate-"))
        .cloned()
        .collect::<Vec<_>>();
    for name in impersonation {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    #[test]
    fn strips_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("x-trace, keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["content-type"], "application/json");
    }

    #[test]
    fn strips_caller_impersonation() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer user"));
        headers.insert("impersonate-user", HeaderValue::from_static("system:admin"));
        headers.insert("impersonate-group", HeaderValue::from_static("system:masters"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_caller_credentials(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }
}
