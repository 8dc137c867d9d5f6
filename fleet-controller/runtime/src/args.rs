use crate::{
    api::{self, Api},
    config::FleetConfig,
    core::Backoff,
    health,
    hub::{self, Hub, HubMetrics},
    proxy::{ProxyMetrics, Router, RouterConfig},
    registry::{ClientFactory, Registry},
    tunnel::{self, TunnelMetrics, TunnelServer},
    upstream::ClusterUpstream,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry as Prometheus;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[clap(name = "fleet", about = "Connects a fleet of Kubernetes clusters")]
pub struct Args {
    #[clap(long, default_value = "fleet=info,warn", env = "FLEET_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8080")]
    api_addr: SocketAddr,

    /// Clusters and identities to serve.
    #[clap(long, env = "FLEET_CONTROLLER_CONFIG")]
    config: PathBuf,

    /// The longest a proxied request may take.
    #[clap(long, default_value = "30000")]
    request_timeout_ms: u64,

    #[clap(long, default_value = "10485760")]
    max_body_bytes: usize,

    /// How long building a client for a directly connected cluster may take.
    #[clap(long, default_value = "10000")]
    connect_timeout_ms: u64,

    #[clap(long, default_value = "10000")]
    tunnel_handshake_timeout_ms: u64,

    #[clap(long, default_value = "15000")]
    tunnel_heartbeat_interval_ms: u64,

    #[clap(long, default_value = "45000")]
    tunnel_idle_timeout_ms: u64,

    #[clap(long, default_value = "64")]
    tunnel_queue_depth: usize,

    /// The number of events that may be queued for a watch subscriber before it is
    /// disconnected.
    #[clap(long, default_value = "256")]
    subscriber_queue_depth: usize,

    #[clap(long, default_value = "500")]
    watch_backoff_min_ms: u64,

    #[clap(long, default_value = "30000")]
    watch_backoff_max_ms: u64,

    /// Consecutive upstream failures after which a watch is reported degraded.
    #[clap(long, default_value = "5")]
    watch_degraded_after: u32,

    /// How often agent-connected clusters are listed to drive their watches.
    #[clap(long, default_value = "5000")]
    agent_poll_interval_ms: u64,

    #[clap(long, default_value = "30000")]
    health_check_interval_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            api_addr,
            config,
            request_timeout_ms,
            max_body_bytes,
            connect_timeout_ms,
            tunnel_handshake_timeout_ms,
            tunnel_heartbeat_interval_ms,
            tunnel_idle_timeout_ms,
            tunnel_queue_depth,
            subscriber_queue_depth,
            watch_backoff_min_ms,
            watch_backoff_max_ms,
            watch_degraded_after,
            agent_poll_interval_ms,
            health_check_interval_ms,
        } = self;

        let request_timeout = Duration::from_millis(request_timeout_ms);
        let connect_timeout = Duration::from_millis(connect_timeout_ms);

        let fleet = FleetConfig::load(&config)?;
        let base = config.parent().map(PathBuf::from).unwrap_or_default();
        let descriptors = fleet.clusters(&base)?;
        let identities = fleet.identities();

        let mut prom = <Prometheus>::default();
        let tunnel_metrics = TunnelMetrics::register(prom.sub_registry_with_prefix("tunnel"));
        let hub_metrics = HubMetrics::register(prom.sub_registry_with_prefix("hub"));
        let proxy_metrics = ProxyMetrics::register(prom.sub_registry_with_prefix("proxy"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let registry = Registry::new(ClientFactory::new(Some(runtime.client()), connect_timeout));
        for descriptor in descriptors {
            debug!(cluster = %descriptor.id, kind = ?descriptor.connection_type(), "Registered");
            registry.register(descriptor);
        }
        info!(
            clusters = registry.list().len(),
            identities = identities.len(),
            "Loaded configuration"
        );

        let tunnel = TunnelServer::new(
            registry.clone(),
            tunnel::Config {
                handshake_timeout: Duration::from_millis(tunnel_handshake_timeout_ms),
                heartbeat_interval: Duration::from_millis(tunnel_heartbeat_interval_ms),
                idle_timeout: Duration::from_millis(tunnel_idle_timeout_ms),
                queue_depth: tunnel_queue_depth,
            },
            tunnel_metrics,
        );

        let upstream = ClusterUpstream::new(
            registry.clone(),
            tunnel.clone(),
            Duration::from_millis(agent_poll_interval_ms),
            request_timeout,
        );
        let hub = Hub::new(
            Arc::new(upstream),
            hub::Config {
                queue_depth: subscriber_queue_depth,
                backoff: Backoff::new(
                    Duration::from_millis(watch_backoff_min_ms),
                    Duration::from_millis(watch_backoff_max_ms),
                ),
                degraded_after: watch_degraded_after,
            },
            hub_metrics,
        );

        let router = Router::new(
            registry.clone(),
            tunnel.clone(),
            RouterConfig {
                max_timeout: request_timeout,
                max_body_bytes,
            },
            proxy_metrics,
        );

        let drain = runtime.shutdown_handle();
        let api = Api::new(
            registry.clone(),
            identities,
            router,
            tunnel.clone(),
            hub,
            drain.clone(),
        );

        tokio::spawn(health::check_all(
            registry,
            Duration::from_millis(health_check_interval_ms),
            connect_timeout,
        ));

        tokio::spawn(api::serve(api_addr, api, drain.clone()));

        // Agent sessions end as soon as shutdown begins.
        tokio::spawn(async move {
            let handle = drain.signaled().await;
            info!("Closing agent sessions");
            tunnel.close_all();
            drop(handle);
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
