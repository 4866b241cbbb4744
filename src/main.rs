//! CLI entry point for instrument-link
//!
//! Provides command-line access to serial instruments:
//! - Listing the serial ports of this machine
//! - Sending one-off commands to an instrument
//! - Checking a configuration file against the connected hardware
//!
//! # Usage
//!
//! ```bash
//! instrument-link ports
//! instrument-link send COM6 '*IDN?' R1
//! instrument-link check --config config/instrument-link.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use instrument_link::config::{LinkConfig, DEFAULT_CONFIG_PATH};
use instrument_link::{logging, serial, LinkRegistry, SerialConnector, SerialLink, TransmitOptions};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "instrument-link")]
#[command(about = "Serial command links for laboratory instruments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports
    Ports,

    /// Open a port, send each command in turn and print the responses
    Send {
        /// Serial port path (e.g. /dev/ttyUSB0 or COM6)
        port: String,

        /// Commands to send, without line terminator
        #[arg(required = true)]
        commands: Vec<String>,

        /// Attempts per command
        #[arg(long)]
        attempts: Option<u32>,
    },

    /// Validate the configuration and try to open every enabled link
    Check {
        /// Print the effective configuration first
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LinkConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    logging::init(&config.application).context("initializing logging")?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Send {
            port,
            commands,
            attempts,
        } => send(&config, port, commands, attempts).await,
        Commands::Check { show } => check(&config, show).await,
    }
}

fn list_ports() -> Result<()> {
    let ports = serial::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

async fn send(
    config: &LinkConfig,
    port: String,
    commands: Vec<String>,
    attempts: Option<u32>,
) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let link = SerialLink::new(port, config.link_settings(), Arc::new(SerialConnector));
    link.open(None).await.context("opening link")?;

    let mut options = TransmitOptions::new();
    if let Some(attempts) = attempts {
        options = options.with_attempts(attempts);
    }

    for command in &commands {
        let response = link
            .transmit_with(
                command,
                &options
                    .clone()
                    .with_error_message(format!("No valid response to {command}")),
            )
            .await;
        println!("{command} -> {response}");
    }

    link.close().await.context("closing link")?;
    Ok(())
}

async fn check(config: &LinkConfig, show: bool) -> Result<()> {
    if show {
        print!("{}", config.to_toml_string()?);
    }

    let registry = LinkRegistry::from_config(config, Arc::new(SerialConnector))
        .context("invalid configuration")?;
    println!("Configuration OK: {} link(s) defined", registry.len());

    let outcomes = registry.open_all().await;
    let failed = outcomes.iter().filter(|(_, outcome)| outcome.is_err()).count();
    for (name, outcome) in &outcomes {
        match outcome {
            Ok(()) => println!("  {name}: open"),
            Err(e) => println!("  {name}: {e}"),
        }
    }
    registry.close_all().await;

    if failed > 0 {
        anyhow::bail!("{failed} link(s) could not be opened");
    }
    Ok(())
}
