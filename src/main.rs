use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lora_joinserver::config::Config;
use lora_joinserver::joinserver::JoinServer;
use lora_joinserver::registry::{load_provisioning, InMemoryRegistry};
use lora_joinserver::server;

#[derive(Parser)]
#[command(name = "lora-joinserver")]
#[command(about = "LoRaWAN 1.1 Join Server")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lora-joinserver v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(InMemoryRegistry::new());
    match &config.join.provisioning {
        Some(path) => {
            let count = load_provisioning(path, registry.as_ref()).await?;
            info!("Provisioned {} device(s) from {:?}", count, path);
        }
        None => {
            info!("No provisioning file configured; registry starts empty");
        }
    }

    if config.join.join_eui_prefixes.is_empty() {
        info!("No JoinEUI prefixes configured; every join will be rejected or forwarded");
    } else {
        for prefix in &config.join.join_eui_prefixes {
            info!("Claiming JoinEUI prefix {}", prefix);
        }
    }

    let join_server = Arc::new(JoinServer::new(
        registry,
        config.join.join_eui_prefixes.clone(),
    ));

    let bind = config.server.bind.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_server(&bind, join_server).await {
            error!("Server failed: {}", e);
        }
    });

    info!("Join Server running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}
