mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use chatrelay_core::{
    bootstrap::{init_services, load_config},
    logging,
};

use server::RelayServer;

/// Presence and call-signaling relay
#[derive(Debug, Parser)]
#[command(name = "chatrelay", version, about)]
struct Cli {
    /// Path to a YAML or TOML config file
    #[arg(short, long, env = "CHATRELAY_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("chatrelay starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Build the relay and start the sweep
    let services = init_services(&config);

    // 4. Serve until shutdown
    RelayServer::new(config, services).start().await
}
