use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tallychain::app::HttpServer;
use tallychain::client::{Client, ServerApi};
use tallychain::config::ClientConfig;

/// Runs one voting client.
#[derive(Debug, Parser)]
#[command(name = "tally-client", version)]
struct Args {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    client_id: Option<u64>,
    /// Server base url. Repeat to vote through several servers.
    #[arg(long = "server")]
    servers: Vec<String>,
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
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(id) = args.client_id {
        config.client_id = id;
    }
    if !args.servers.is_empty() {
        config.servers = args.servers;
    }
    if let Some(ms) = args.tick_ms {
        config.tick_interval_ms = ms;
    }

    let servers: Vec<Arc<dyn ServerApi>> = config
        .servers
        .iter()
        .map(|url| -> Arc<dyn ServerApi> { Arc::new(HttpServer::new(url.as_str())) })
        .collect();
    let client = Arc::new(Client::new(&config, servers).context("starting client")?);

    tokio::select! {
        res = client.run() => res.context("client stopped")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
    Ok(())
}
