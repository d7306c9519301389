use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use sentinel_server::{Config, Server};

/// Sentinel control plane.
#[derive(Debug, Parser)]
#[command(name = "sentinel-cp", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "sentinel.toml")]
    config: PathBuf,
    /// Override the bind address from the config file.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        warn!(path = %args.config.display(), "config file not found; using defaults");
        Config::default()
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    let server = Server::start(config).await?;
    server.run_until_shutdown().await
}
