use crate::ClusterId;
use http::StatusCode;
use thiserror::Error;

/// Failures surfaced by the connectivity layer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("cluster {0} not found")]
    ClusterNotFound(ClusterId),

    #[error("unauthorized")]
    Unauthorized,

    #[error("failed to build client for cluster {cluster}: {reason}")]
    Transport { cluster: ClusterId, reason: String },

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("agent session closed")]
    SessionClosed,

    #[error("subscriber is not keeping up with events")]
    Backpressure,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ClusterNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Transport { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamUnreachable(_) | Self::SessionClosed | Self::Protocol(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// A stable, low-cardinality name for the failure, used in metrics and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClusterNotFound(_) => "ClusterNotFound",
            Self::Unauthorized => "Unauthorized",
            Self::Transport { .. } => "TransportError",
            Self::UpstreamUnreachable(_) => "UpstreamUnreachable",
            Self::Timeout => "Timeout",
            Self::SessionClosed => "SessionClosed",
            Self::Backpressure => "Backpressure",
            Self::Protocol(_) => "ProtocolError",
        }
    }

    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}
