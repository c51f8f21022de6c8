use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ant_hrm::config::Config;
use ant_hrm::manager::ChannelManager;
use ant_hrm::radio::sim::SimRadio;
use ant_hrm::readings::SharedReadingTable;

#[derive(Parser)]
#[command(name = "ant-hrm")]
#[command(about = "Dynamic ANT+ channel allocation for multi-device heart-rate tracking")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the number of simulated heart-rate monitors
    #[arg(long)]
    devices: Option<usize>,

    /// Seconds between reading-table snapshots in the log
    #[arg(long, default_value_t = 5)]
    snapshot_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });
    config.apply_env_overrides();
    if let Some(devices) = cli.devices {
        config.sim.devices = devices;
    }

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("ant-hrm v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "wildcard scanner + up to {} dedicated channels ({} hardware)",
        config
            .manager
            .effective_max_dedicated(config.radio.hardware_channels),
        config.radio.hardware_channels
    );

    let readings = SharedReadingTable::new();
    let radio = SimRadio::new(config.sim.clone(), config.radio.hardware_channels);
    info!("Using simulated radio ({} virtual monitors)", config.sim.devices);

    let handle = ChannelManager::start(&config, readings.clone(), Box::new(radio))?;

    // Periodically log the live reading table as JSON
    let snapshot_readings = readings.clone();
    let snapshot_interval = Duration::from_secs(cli.snapshot_secs.max(1));
    let snapshot = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(snapshot_interval);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            let recent = snapshot_readings.list_recent(snapshot_interval.as_secs() * 2);
            match serde_json::to_string(&recent) {
                Ok(json) => info!("readings ({} active): {}", recent.len(), json),
                Err(e) => error!("Failed to serialize readings: {}", e),
            }
        }
    });

    info!("Manager running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    snapshot.abort();
    handle.stop().await;

    Ok(())
}
