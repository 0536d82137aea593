mod bridge;
mod cli;
mod client;
mod geo;
mod ipc;

use std::time::Duration;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

use bridge::BridgeConfig;
use geo::registry::RegistryConfig;
use geo::sim::SimConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            permission,
            no_location_mode,
            lat,
            lon,
            altitude,
            accuracy,
            speed,
            heading,
            no_fix,
            fetch_timeout_ms,
        } => {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                eprintln!("geolocd serve: --lat must be within ±90 and --lon within ±180");
                std::process::exit(1);
            }
            let config = BridgeConfig {
                permission,
                sim: SimConfig {
                    latitude: lat,
                    longitude: lon,
                    altitude,
                    accuracy,
                    speed,
                    heading,
                    location_mode: !no_location_mode,
                    has_fix: !no_fix,
                },
                registry: RegistryConfig {
                    fetch_timeout: (fetch_timeout_ms > 0)
                        .then(|| Duration::from_millis(fetch_timeout_ms)),
                },
            };
            if let Err(e) = bridge::run(config).await {
                tracing::error!(error = %e, "bridge failed");
                eprintln!("geolocd serve: {e}");
                std::process::exit(1);
            }
        }
        Command::Client { action } => {
            if let Err(e) = client::run(action).await {
                tracing::error!(error = %e, "client failed");
                eprintln!("geolocd client: {e}");
                std::process::exit(1);
            }
        }
    }
}
