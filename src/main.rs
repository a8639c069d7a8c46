use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

use lims_sync::config::Listen;
use lims_sync::{Config, Node};

#[derive(Parser, Debug)]
#[command(version, about = "Peer-to-peer synchronization node for laboratory data")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "lims-sync.toml")]
    config: PathBuf,
    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Override (or enable) the listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Disable TLS verification and treat every connection as a lab peer.
    /// Test setups only.
    #[arg(long)]
    insecure: bool,
    /// Accept inbound connections but never dial out.
    #[arg(long)]
    introvert: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = cli.port {
        match &mut config.listen {
            Some(listen) => listen.port = port,
            None => {
                config.listen = Some(Listen {
                    host: "0.0.0.0".to_string(),
                    port,
                })
            }
        }
    }
    config.insecure |= cli.insecure;
    config.introvert |= cli.introvert;

    let node = Node::start(config).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}
