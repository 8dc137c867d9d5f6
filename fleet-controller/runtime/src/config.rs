//! The controller's cluster and identity configuration file.
//!
//! ```yaml
//! clusters:
//!   - id: host
//!     inCluster: true
//!   - id: prod-east
//!     kubeconfig:
//!       path: /etc/fleet/prod-east.yaml
//!       context: admin@prod-east
//!   - id: edge-7
//!     agent:
//!       id: edge-7-agent
//!       token: edge-7-s3cret
//! identities:
//!   - token: alice-t0ken
//!     userId: alice
//!     email: alice@example.com
//!     permissions:
//!       - clusters: [prod-east]
//!         namespaces: [payments]
//! ```

use crate::{
    auth::Identities,
    core::{AgentBinding, ClusterDescriptor, ClusterId, Credentials, Identity, Scope},
};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FleetConfig {
    #[serde(default)]
    clusters: Vec<ClusterConfig>,
    #[serde(default)]
    identities: Vec<IdentityConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ClusterConfig {
    id: String,
    #[serde(default)]
    kubeconfig: Option<KubeconfigSource>,
    #[serde(default)]
    in_cluster: bool,
    #[serde(default)]
    agent: Option<AgentConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct KubeconfigSource {
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    inline: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AgentConfig {
    id: String,
    token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct IdentityConfig {
    token: String,
    user_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    permissions: Scope,
}

// === impl FleetConfig ===

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml(&yaml)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Builds the configured cluster descriptors, reading kubeconfig files relative to `base`.
    pub fn clusters(&self, base: &Path) -> Result<Vec<ClusterDescriptor>> {
        let mut seen = ahash::AHashSet::new();
        let mut clusters = Vec::with_capacity(self.clusters.len());
        for cluster in &self.clusters {
            let id = cluster.id.parse::<ClusterId>()?;
            if !seen.insert(id.clone()) {
                bail!("cluster {id} is configured more than once");
            }
            let descriptor = cluster
                .descriptor(id.clone(), base)
                .with_context(|| format!("invalid configuration for cluster {id}"))?;
            clusters.push(descriptor);
        }
        Ok(clusters)
    }

    pub fn identities(&self) -> Identities {
        Identities::new(self.identities.iter().map(|id| {
            let identity = Identity {
                user_id: id.user_id.clone(),
                email: id.email.clone(),
                permissions: id.permissions.clone(),
            };
            (id.token.clone(), identity)
        }))
    }
}

// === impl ClusterConfig ===

impl ClusterConfig {
    fn descriptor(&self, id: ClusterId, base: &Path) -> Result<ClusterDescriptor> {
        match (&self.kubeconfig, self.in_cluster, &self.agent) {
            (Some(source), false, None) => {
                let kubeconfig = match (&source.path, &source.inline) {
                    (Some(path), None) => {
                        let path = base.join(path);
                        std::fs::read_to_string(&path)
                            .with_context(|| format!("failed to read {}", path.display()))?
                    }
                    (None, Some(inline)) => inline.clone(),
                    _ => bail!("kubeconfig must set exactly one of path or inline"),
                };
                let credentials = Credentials::Kubeconfig {
                    kubeconfig,
                    context: source.context.clone(),
                };
                Ok(ClusterDescriptor::direct(id, credentials))
            }
            (None, true, None) => Ok(ClusterDescriptor::direct(id, Credentials::InCluster)),
            (None, false, Some(agent)) => {
                if agent.token.is_empty() {
                    bail!("agent token must not be empty");
                }
                let binding = AgentBinding::new(agent.id.clone(), &agent.token);
                Ok(ClusterDescriptor::agent(id, binding))
            }
            _ => bail!("exactly one of kubeconfig, inCluster or agent must be set"),
        }
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}
