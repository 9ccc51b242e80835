//! House Scheduler Binary
//!
//! Runs the HTTP API together with the maintenance workers.

use clap::{Parser, Subcommand};
use house_scheduler::{
    api::ApiServer,
    common::{clock::SystemClock, config::ConfigLoader},
    games::SchnorrkelOracle,
    lease::InMemoryLeaseLock,
    ledger::InMemoryLedger,
    maintenance, HouseConfig, HouseDeps, HouseService,
};
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[derive(Parser)]
#[command(name = "house-scheduler")]
#[command(about = "Liquidity scheduler for house-backed games")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use relaxed development defaults instead of production ones
    #[arg(long)]
    dev: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the API and run maintenance workers
    Serve {
        /// Override the API host
        #[arg(long)]
        host: Option<String>,

        /// Override the API port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate the configuration and print it as TOML
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<HouseConfig, Box<dyn std::error::Error>> {
    if cli.dev && cli.config.is_none() {
        let config = HouseConfig::development();
        config.validate()?;
        return Ok(config);
    }
    let loader = match &cli.config {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    Ok(loader.load()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "house_scheduler=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            serve(config).await
        }
    }
}

async fn serve(config: HouseConfig) -> Result<(), Box<dyn std::error::Error>> {
    let clock = Arc::new(SystemClock);
    let oracle = SchnorrkelOracle::new_random();
    info!(vrf_public_key = %oracle.public_key_hex(), "VRF oracle ready");

    let deps = HouseDeps {
        ledger: Arc::new(InMemoryLedger::new()),
        lease: Arc::new(InMemoryLeaseLock::new(clock.clone())),
        oracle: Arc::new(oracle),
        clock,
    };

    let api_config = config.api.clone();
    let service = Arc::new(HouseService::new(config, deps)?);
    let workers = maintenance::spawn_workers(service.clone());

    let result = ApiServer::new(api_config, service.clone()).run().await;

    workers.shutdown().await;
    service.shutdown();
    result
}
