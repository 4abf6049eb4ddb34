//! geotether - device tunnels and simulated location over HTTP
//!
//! Subcommands:
//! - `geotether serve` - Run the HTTP control surface
//! - `geotether devices` - Print attached devices as JSON
//! - `geotether config` - Print the effective configuration

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geotether::device::{group_devices, DeviceDirectory, PyMobileDevice};
use geotether::{serve, telemetry};
use tetherconf::TetherConfig;

#[derive(Parser)]
#[command(name = "geotether")]
#[command(about = "Device tunnels and simulated location over HTTP")]
#[command(version)]
struct Cli {
    /// Config file (replaces ./geotether.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control surface
    Serve {
        /// HTTP port to bind (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// List attached devices
    Devices,

    /// Show the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = TetherConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.infra.bind.http_port = port;
            }
            if let Some(host) = host {
                config.infra.bind.host = host;
            }

            telemetry::init(&config.infra.telemetry)?;
            serve::run(&config).await?;
        }
        Commands::Devices => {
            telemetry::init_cli(&config.infra.telemetry.log_level);

            let backend = PyMobileDevice::from_config(&config.device);
            let devices = backend.list().await.context("Failed to list devices")?;
            println!("{}", serde_json::to_string_pretty(&group_devices(devices))?);
        }
        Commands::Config => {
            print!("{}", config.to_toml());
            println!();
            println!("# Sources:");
            if sources.files.is_empty() {
                println!("#   (no config files, using defaults)");
            }
            for file in &sources.files {
                println!("#   file: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("#   env:  {}", var);
            }
        }
    }

    Ok(())
}
