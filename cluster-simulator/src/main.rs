use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod scenario;

use config::SimulatorConfig;
use scenario::Simulator;

const DEFAULT_CONFIG_PATH: &str = "config/cluster.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting Cluster Simulator");

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = if Path::new(&path).exists() {
        SimulatorConfig::from_file(&path)?
    } else {
        warn!("Config {} not found, using defaults", path);
        SimulatorConfig::default()
    };

    let simulator = Simulator::start(config)?;
    let result = simulator.run().await;
    simulator.shutdown().await;
    result?;

    info!("Simulation finished");
    Ok(())
}
