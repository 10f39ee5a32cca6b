//! blocksyncd - Replication session server
//!
//! Hosts the authoritative datablock graph for one replication session
//! and fans updates out to every connected client.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blocksync_server::ServerConfig;

/// Blocksync Server Configuration
#[derive(Parser, Debug)]
#[command(name = "blocksyncd")]
#[command(author = "Blocksync Contributors")]
#[command(version)]
#[command(about = "Real-time datablock replication server", long_about = None)]
struct Cli {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Base port; the session uses this port and the three above it
    #[arg(short, long, default_value_t = 5560)]
    port: u16,

    /// Shared secret for the admin role
    #[arg(long, default_value = "admin")]
    password: String,

    /// Peer timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout: u64,

    /// Optional JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    config.bind = cli.bind;
    config.base_port = cli.port;
    config.password = cli.password;
    config.connection_timeout_ms = cli.timeout;

    info!("starting blocksyncd on {}:{}", config.bind, config.base_port);
    let handle = blocksync_server::listen(config).await?;
    info!("ready to accept replication clients");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
