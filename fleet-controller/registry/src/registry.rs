use crate::ClientFactory;
use ahash::AHashMap as HashMap;
use fleet_controller_core::{ClusterDescriptor, ClusterId, Error, Health};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// The authoritative set of clusters known to the control plane.
///
/// Every proxied request and watch resolves its cluster here, so lookups take a shared lock and
/// return owned snapshots. Descriptors change only when clusters are (de)registered or checked.
#[derive(Clone, Debug)]
pub struct Registry {
    clusters: Arc<RwLock<Clusters>>,
    clients: Arc<ClientFactory>,
    /// Counts registrations and deregistrations.
    changes: Arc<watch::Sender<u64>>,
}

#[derive(Debug, Default)]
struct Clusters {
    by_id: HashMap<ClusterId, ClusterDescriptor>,
    order: Vec<ClusterId>,
}

// === impl Registry ===

impl Registry {
    pub fn new(clients: ClientFactory) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            clusters: Default::default(),
            clients: Arc::new(clients),
            changes: Arc::new(changes),
        }
    }

    /// Adds a cluster or replaces its descriptor, returning the replaced descriptor. A replaced
    /// cluster keeps its position in listings.
    pub fn register(&self, descriptor: ClusterDescriptor) -> Option<ClusterDescriptor> {
        let id = descriptor.id.clone();
        let connection = descriptor.connection_type();
        let fingerprint = descriptor.fingerprint();
        let prior = {
            let mut clusters = self.clusters.write();
            let prior = clusters.by_id.insert(id.clone(), descriptor);
            if prior.is_none() {
                clusters.order.push(id.clone());
            }
            prior
        };
        match &prior {
            Some(prior) => {
                // A client built for the old connection must not serve the new one.
                if prior.fingerprint() != fingerprint {
                    self.clients.evict(&id);
                }
                tracing::info!(cluster = %id, ?connection, "Updated cluster");
            }
            None => tracing::info!(cluster = %id, ?connection, "Registered cluster"),
        }
        self.changes.send_modify(|n| *n += 1);
        prior
    }

    pub fn deregister(&self, id: &ClusterId) -> Result<ClusterDescriptor, Error> {
        let removed = {
            let mut clusters = self.clusters.write();
            let removed = clusters
                .by_id
                .remove(id)
                .ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
            clusters.order.retain(|c| c != id);
            removed
        };
        self.clients.evict(id);
        self.changes.send_modify(|n| *n += 1);
        tracing::info!(cluster = %id, "Deregistered cluster");
        Ok(removed)
    }

    pub fn get(&self, id: &ClusterId) -> Result<ClusterDescriptor, Error> {
        self.clusters
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound(id.clone()))
    }

    /// Records the outcome of a health check or a connectivity change.
    pub fn update_health(&self, id: &ClusterId, health: Health) -> Result<(), Error> {
        let mut clusters = self.clusters.write();
        let descriptor = clusters
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::ClusterNotFound(id.clone()))?;
        if descriptor.status != health.status {
            tracing::info!(
                cluster = %id,
                from = ?descriptor.status,
                to = ?health.status,
                message = health.message.as_deref().unwrap_or_default(),
                "Cluster status changed",
            );
        }
        descriptor.status = health.status;
        descriptor.last_health = Some(health);
        Ok(())
    }

    /// Snapshots all clusters in registration order.
    pub fn list(&self) -> Vec<ClusterDescriptor> {
        let clusters = self.clusters.read();
        clusters
            .order
            .iter()
            .filter_map(|id| clusters.by_id.get(id).cloned())
            .collect()
    }

    /// Resolves an API client for a directly connected cluster.
    pub async fn client(&self, id: &ClusterId) -> Result<kube::Client, Error> {
        let descriptor = self.get(id)?;
        self.clients.client_for(&descriptor).await
    }

    pub fn clients(&self) -> &ClientFactory {
        &self.clients
    }

    /// Notifies the receiver whenever a cluster is registered, replaced or deregistered.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
