use crate::{Agent, Config, KubeExecutor};
use anyhow::{bail, Result};
use clap::Parser;
use fleet_controller_core::{tunnel::Hello, Backoff, ClusterId};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "fleet-agent", about = "Connects a cluster to the fleet control plane")]
pub struct Args {
    #[clap(long, default_value = "fleet_agent=info,warn", env = "FLEET_AGENT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The control plane's agent endpoint.
    #[clap(long, env = "FLEET_AGENT_SERVER")]
    server: String,

    #[clap(long, env = "FLEET_AGENT_CLUSTER_ID")]
    cluster_id: ClusterId,

    #[clap(long, env = "FLEET_AGENT_ID")]
    agent_id: String,

    #[clap(long, env = "FLEET_AGENT_TOKEN", hide_env_values = true)]
    token: String,

    #[clap(long, default_value = "10000")]
    handshake_timeout_ms: u64,

    /// The longest a request may take against the local API server.
    #[clap(long, default_value = "30000")]
    request_timeout_ms: u64,

    #[clap(long, default_value = "10485760")]
    max_body_bytes: usize,

    #[clap(long, default_value = "500")]
    reconnect_backoff_min_ms: u64,

    #[clap(long, default_value = "30000")]
    reconnect_backoff_max_ms: u64,
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
            server,
            cluster_id,
            agent_id,
            token,
            handshake_timeout_ms,
            request_timeout_ms,
            max_body_bytes,
            reconnect_backoff_min_ms,
            reconnect_backoff_max_ms,
        } = self;

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder())
            .with_client(client)
            .build()
            .await?;

        let executor = KubeExecutor::new(
            runtime.client(),
            Duration::from_millis(request_timeout_ms),
            max_body_bytes,
        );
        let span = info_span!("agent", cluster = %cluster_id, agent = %agent_id);
        let agent = Agent::new(
            Config {
                url: server,
                hello: Hello {
                    cluster_id,
                    agent_id,
                    token,
                },
                handshake_timeout: Duration::from_millis(handshake_timeout_ms),
                backoff: Backoff::new(
                    Duration::from_millis(reconnect_backoff_min_ms),
                    Duration::from_millis(reconnect_backoff_max_ms),
                ),
            },
            executor,
        );
        info!(parent: &span, "Starting");
        tokio::spawn(agent.run(runtime.shutdown_handle()).instrument(span));

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
