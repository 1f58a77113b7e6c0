use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use peer_ring_kv::{cli::Cli, config::ClusterConfig, http, node};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cluster = ClusterConfig::load(&cli.config)?;
    let rest_addr = cluster.rest_addr(&cli.id)?.to_string();
    let config = cli.node_config(cluster)?;

    let node = node::start(config).await?;
    let listener = TcpListener::bind(&rest_addr)
        .await
        .with_context(|| format!("cannot bind http listener on {rest_addr}"))?;

    let served = http::serve(listener, node.store(), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl_c: {err:?}");
        }
        info!("ctrl_c received, shutting down");
    })
    .await;

    node.shutdown().await;
    served.context("http server failed")
}
