//! flexrig CLI - operator front-end for the capture backbone.

mod cli;
mod commands;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use flexrig_core::{BleTransport, Coordinator, RigConfig, Transport, TransportConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Write logs to stderr so stdout stays clean for data.
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => RigConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RigConfig::load_default().context("loading default config")?,
    };

    let transport = Arc::new(BleTransport::new(TransportConfig {
        name_patterns: config.device_name_patterns.clone(),
        min_rssi: config.min_rssi,
    })) as Arc<dyn Transport>;

    let rig = Coordinator::new(config, transport).context("building coordinator")?;
    if !rig.initialize().await.context("initializing transport")? {
        anyhow::bail!("no Bluetooth adapter available");
    }

    match cli.command {
        Commands::Scan { timeout, json } => {
            commands::cmd_scan(&rig, timeout, json, cli.quiet).await?;
        }
        Commands::Devices { json } => {
            commands::cmd_devices(&rig, json)?;
        }
        Commands::Sync => {
            commands::cmd_sync(&rig, cli.quiet).await?;
        }
        Commands::Record {
            session,
            exercise,
            set,
            duration,
        } => {
            commands::cmd_record(&rig, &session, &exercise, set, duration, cli.quiet).await?;
        }
        Commands::Watch { duration } => {
            commands::cmd_watch(&rig, duration, cli.quiet).await?;
        }
        Commands::Locate { duration } => {
            commands::cmd_locate(&rig, duration, cli.quiet).await?;
        }
    }

    Ok(())
}
