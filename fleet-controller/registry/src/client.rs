use ahash::AHashMap as HashMap;
use fleet_controller_core::{
    ClusterDescriptor, ClusterId, Connection, Credentials, Error, Fingerprint,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Builds API clients for directly connected clusters.
///
/// Clients are memoized per cluster and reused for as long as the cluster's credentials are
/// unchanged. A descriptor whose credentials differ from the cached client's causes a rebuild.
pub struct ClientFactory {
    /// The client for the cluster this process runs in, used for `InCluster` credentials.
    local: Option<kube::Client>,
    connect_timeout: Duration,
    cache: Mutex<HashMap<ClusterId, Cached>>,
    built: AtomicU64,
}

struct Cached {
    fingerprint: Fingerprint,
    client: kube::Client,
}

fn transport(cluster: &ClusterId, reason: impl fmt::Display) -> Error {
    Error::Transport {
        cluster: cluster.clone(),
        reason: reason.to_string(),
    }
}

// === impl ClientFactory ===

impl ClientFactory {
    pub fn new(local: Option<kube::Client>, connect_timeout: Duration) -> Self {
        Self {
            local,
            connect_timeout,
            cache: Mutex::default(),
            built: AtomicU64::new(0),
        }
    }

    /// Returns a client for the cluster, building one if needed.
    pub async fn client_for(&self, descriptor: &ClusterDescriptor) -> Result<kube::Client, Error> {
        let credentials = match &descriptor.connection {
            Connection::Direct(credentials) => credentials,
            Connection::Agent(_) => {
                return Err(transport(
                    &descriptor.id,
                    "cluster is reachable only through its agent",
                ))
            }
        };

        let fingerprint = descriptor.fingerprint();
        if let Some(cached) = self.cache.lock().get(&descriptor.id) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.client.clone());
            }
        }

        // Concurrent misses may each build a client; the last one to finish is kept.
        let client = self.build(&descriptor.id, credentials).await?;
        self.built.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cluster = %descriptor.id, ?fingerprint, "Built client");
        self.cache.lock().insert(
            descriptor.id.clone(),
            Cached {
                fingerprint,
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Drops any cached client for the cluster.
    pub fn evict(&self, cluster: &ClusterId) {
        if self.cache.lock().remove(cluster).is_some() {
            tracing::debug!(%cluster, "Evicted client");
        }
    }

    pub fn is_cached(&self, cluster: &ClusterId) -> bool {
        self.cache.lock().contains_key(cluster)
    }

    /// The number of clients built since the factory was created.
    pub fn built(&self) -> u64 {
        self.built.load(Ordering::Relaxed)
    }

    async fn build(
        &self,
        cluster: &ClusterId,
        credentials: &Credentials,
    ) -> Result<kube::Client, Error> {
        match credentials {
            Credentials::InCluster => self
                .local
                .clone()
                .ok_or_else(|| transport(cluster, "no in-cluster client is configured")),

            Credentials::Kubeconfig {
                kubeconfig,
                context,
            } => {
                let kubeconfig =
                    Kubeconfig::from_yaml(kubeconfig).map_err(|e| transport(cluster, e))?;
                let options = KubeConfigOptions {
                    context: context.clone(),
                    ..KubeConfigOptions::default()
                };
                let mut config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| transport(cluster, e))?;
                config.connect_timeout = Some(self.connect_timeout);
                kube::Client::try_from(config).map_err(|e| transport(cluster, e))
            }
        }
    }
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("in_cluster", &self.local.is_some())
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_controller_core::AgentBinding;

    fn kubeconfig(server: &str, token: &str) -> String {
        format!(
            r#"
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: {server}
users:
- name: test
  user:
    token: {token}
contexts:
- name: test
  context:
    cluster: test
    user: test
current-context: test
"#
        )
    }

    fn direct(id: &str, kubeconfig: String) -> ClusterDescriptor {
        ClusterDescriptor::direct(
            ClusterId::new(id),
            Credentials::Kubeconfig {
                kubeconfig,
                context: None,
            },
        )
    }

    #[tokio::test]
    async fn memoizes_by_fingerprint() {
        let factory = ClientFactory::new(None, Duration::from_secs(1));
        let c1 = direct("c1", kubeconfig("http://127.0.0.1:6443", "t1"));

        factory.client_for(&c1).await.expect("client must build");
        factory.client_for(&c1).await.expect("client must build");
        assert_eq!(factory.built(), 1);

        // Rotated credentials must not reuse the old client.
        let rotated = direct("c1", kubeconfig("http://127.0.0.1:6443", "t2"));
        factory.client_for(&rotated).await.expect("client must build");
        assert_eq!(factory.built(), 2);

        factory.evict(&c1.id);
        factory.client_for(&rotated).await.expect("client must build");
        assert_eq!(factory.built(), 3);
    }

    #[tokio::test]
    async fn malformed_kubeconfig() {
        let factory = ClientFactory::new(None, Duration::from_secs(1));
        let err = factory
            .client_for(&direct("c1", "clusters: [".to_string()))
            .await
            .err().expect("kubeconfig must not parse");
        assert!(matches!(err, Error::Transport { ref cluster, .. } if cluster.as_str() == "c1"));
        assert_eq!(factory.built(), 0);
    }

    #[tokio::test]
    async fn unknown_context() {
        let factory = ClientFactory::new(None, Duration::from_secs(1));
        let mut descriptor = direct("c1", kubeconfig("http://127.0.0.1:6443", "t1"));
        descriptor.connection = Connection::Direct(Credentials::Kubeconfig {
            kubeconfig: kubeconfig("http://127.0.0.1:6443", "t1"),
            context: Some("missing".to_string()),
        });
        let err = factory.client_for(&descriptor).await.err().unwrap();
        assert!(matches!(err, Error::Transport { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn in_cluster_requires_local_client() {
        let factory = ClientFactory::new(None, Duration::from_secs(1));
        let descriptor = ClusterDescriptor::direct(ClusterId::new("local"), Credentials::InCluster);
        let err = factory.client_for(&descriptor).await.err().unwrap();
        assert!(matches!(err, Error::Transport { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn agent_clusters_have_no_direct_client() {
        let factory = ClientFactory::new(None, Duration::from_secs(1));
        let descriptor =
            ClusterDescriptor::agent(ClusterId::new("edge"), AgentBinding::new("a", "t"));
        let err = factory.client_for(&descriptor).await.err().unwrap();
        assert!(matches!(err, Error::Transport { .. }), "{err:?}");
    }
}
