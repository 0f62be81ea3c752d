use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tallychain::app;
use tallychain::config::ServerConfig;
use tallychain::node::Node;

/// Runs one commit server.
#[derive(Debug, Parser)]
#[command(name = "tally-server", version)]
struct Args {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_id: Option<u64>,
    #[arg(long)]
    listen: Option<SocketAddr>,
    #[arg(long)]
    tick_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tallychain=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(id) = args.server_id {
        config.server_id = id;
    }
    if let Some(addr) = args.listen {
        config.listen_addr = addr;
    }
    if let Some(ms) = args.tick_ms {
        config.tick_interval_ms = ms;
    }

    let node = Arc::new(Node::new(config).context("starting server")?);
    let transport = Arc::new(app::HttpPeers::new(node.config().peers.clone()));
    let router = app::router(node.clone(), node.clone());
    let addr = node.config().listen_addr;

    tokio::select! {
        res = app::serve(addr, router) => res.context("http listener")?,
        res = node.clone().run(transport) => res.context("server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
    Ok(())
}
