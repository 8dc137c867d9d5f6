use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr, sync::Arc};

/// Identifies a managed cluster.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(Arc<str>);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid cluster id {0:?}: must be non-empty and must not contain '/'")]
pub struct InvalidClusterId(String);

#[derive(Clone, Debug)]
pub struct ClusterDescriptor {
    pub id: ClusterId,
    pub connection: Connection,
    pub last_health: Option<Health>,
    pub status: ClusterStatus,
}

#[derive(Clone, Debug)]
pub enum Connection {
    Direct(Credentials),
    Agent(AgentBinding),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Direct,
    Agent,
}

#[derive(Clone)]
pub enum Credentials {
    /// A kubeconfig document, optionally selecting a context other than its current one.
    Kubeconfig {
        kubeconfig: String,
        context: Option<String>,
    },

    /// Use the control plane's own client for the cluster it runs in.
    InCluster,
}

/// Binds a cluster to the one agent allowed to serve it.
#[derive(Clone)]
pub struct AgentBinding {
    pub agent_id: String,
    token: Fingerprint,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterStatus {
    #[default]
    Unknown,
    Connected,
    Disconnected,
    Unhealthy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: ClusterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

// === impl ClusterId ===

impl ClusterId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ClusterId {
    type Err = InvalidClusterId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains('/') {
            return Err(InvalidClusterId(s.to_string()));
        }
        Ok(Self::new(s))
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

// === impl ClusterDescriptor ===

impl ClusterDescriptor {
    pub fn direct(id: ClusterId, credentials: Credentials) -> Self {
        Self {
            id,
            connection: Connection::Direct(credentials),
            last_health: None,
            status: ClusterStatus::Unknown,
        }
    }

    pub fn agent(id: ClusterId, binding: AgentBinding) -> Self {
        Self {
            id,
            connection: Connection::Agent(binding),
            last_health: None,
            status: ClusterStatus::Disconnected,
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self.connection {
            Connection::Direct(_) => ConnectionType::Direct,
            Connection::Agent(_) => ConnectionType::Agent,
        }
    }

    /// Identifies the descriptor's credentials or agent binding. Cached clients are rebuilt when
    /// this changes.
    pub fn fingerprint(&self) -> Fingerprint {
        match &self.connection {
            Connection::Direct(Credentials::Kubeconfig {
                kubeconfig,
                context,
            }) => Fingerprint::of(&[
                b"kubeconfig",
                kubeconfig.as_bytes(),
                context.as_deref().unwrap_or_default().as_bytes(),
            ]),
            Connection::Direct(Credentials::InCluster) => Fingerprint::of(&[b"in-cluster"]),
            Connection::Agent(AgentBinding { agent_id, token }) => {
                Fingerprint::of(&[b"agent", agent_id.as_bytes(), &token.0])
            }
        }
    }
}

// === impl Credentials ===

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kubeconfig { context, .. } => f
                .debug_struct("Kubeconfig")
                .field("context", context)
                .finish_non_exhaustive(),
            Self::InCluster => f.write_str("InCluster"),
        }
    }
}

// === impl AgentBinding ===

impl AgentBinding {
    pub fn new(agent_id: impl Into<String>, token: &str) -> Self {
        Self {
            agent_id: agent_id.into(),
            token: Fingerprint::of(&[token.as_bytes()]),
        }
    }

    /// Checks an agent's handshake credentials against the binding.
    pub fn verify(&self, agent_id: &str, token: &str) -> bool {
        let presented = Fingerprint::of(&[token.as_bytes()]);
        // Digests are compared in full so the comparison time does not depend on the token.
        let same_token = self
            .token
            .0
            .iter()
            .zip(presented.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
        same_token && self.agent_id == agent_id
    }
}

impl fmt::Debug for AgentBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBinding")
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

// === impl Fingerprint ===

impl Fingerprint {
    pub fn of(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

// === impl Health ===

impl Health {
    pub fn new(status: ClusterStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            checked_at: Utc::now(),
        }
    }
}
