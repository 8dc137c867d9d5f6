use crate::{
    core::{ClusterId, ClusterStatus, ConnectionType, Health},
    registry::Registry,
};
use futures::future;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, instrument};

/// Periodically checks every directly connected cluster's API server.
///
/// Agent clusters are skipped; their status follows their tunnel sessions.
#[instrument(skip_all)]
pub(crate) async fn check_all(registry: Registry, interval: Duration, timeout: Duration) {
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        let direct = registry
            .list()
            .into_iter()
            .filter(|c| c.connection_type() == ConnectionType::Direct)
            .map(|c| check_one(&registry, c.id, timeout));
        future::join_all(direct).await;
    }
}

async fn check_one(registry: &Registry, cluster: ClusterId, timeout: Duration) {
    let health = check(registry, &cluster, timeout).await;
    debug!(%cluster, status = ?health.status, message = ?health.message, "Checked");
    // The cluster may have been deregistered in the meantime.
    let _ = registry.update_health(&cluster, health);
}

async fn check(registry: &Registry, cluster: &ClusterId, timeout: Duration) -> Health {
    let client = match registry.client(cluster).await {
        Ok(client) => client,
        Err(error) => return Health::new(ClusterStatus::Unhealthy, Some(error.to_string())),
    };
    match time::timeout(timeout, client.apiserver_version()).await {
        Ok(Ok(_)) => Health::new(ClusterStatus::Connected, None),
        Ok(Err(error)) => Health::new(ClusterStatus::Unhealthy, Some(error.to_string())),
        Err(_) => Health::new(
            ClusterStatus::Unhealthy,
            Some("version request timed out".to_string()),
        ),
    }
}
