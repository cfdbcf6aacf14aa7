//! Wharf message bus - command line publisher
//!
//! Connects to the configured queue and publishes JSON messages, either one
//! from the command line or one per line of standard input.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use wharf_messagebus::observability::{init_logging, LogSettings};
use wharf_messagebus::{BusConfig, ConnectionSupervisor, LapinBroker, SupervisorState};

const DEFAULT_CONFIG_PATHS: &[&str] = &["wharf.toml", "config/wharf.toml"];

/// Self-healing AMQP publisher for a single durable queue
#[derive(Parser)]
#[command(name = "wharf-publish")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single JSON message and exit
    Publish {
        /// JSON document to publish
        #[arg(short, long)]
        message: String,
    },
    /// Publish every line of standard input as a JSON message
    Pipe,
    /// Validate configuration
    Config {
        /// Print the configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut settings = LogSettings::from_env();
    match cli.verbose {
        0 => {}
        1 => settings.level = tracing::Level::DEBUG,
        _ => settings.level = tracing::Level::TRACE,
    }
    init_logging(&settings);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish { message } => publish_one(&config, &message).await,
        Commands::Pipe => pipe_stdin(&config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>) -> Result<BusConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BusConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BusConfig::load_from_file(path)?);
        }
    }

    Err("no configuration file found, pass one with -c/--config or create wharf.toml".into())
}

async fn connect(config: &BusConfig) -> Result<ConnectionSupervisor, Box<dyn std::error::Error>> {
    let supervisor =
        ConnectionSupervisor::new(config.to_supervisor_config()?, Arc::new(LapinBroker::new()))?;
    supervisor.connect().await?;
    Ok(supervisor)
}

async fn publish_one(config: &BusConfig, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let document: serde_json::Value = serde_json::from_str(message)?;
    let supervisor = connect(config).await?;

    let published = supervisor.publish(&document).await;
    let closed = supervisor.close().await;
    published?;
    closed?;

    info!(queue = %config.queue.name, "Message published");
    Ok(())
}

async fn pipe_stdin(config: &BusConfig) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = connect(config).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0u64;

    info!(queue = %config.queue.name, "Publishing standard input, one message per line");

    let outcome: Result<(), Box<dyn std::error::Error>> = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let document: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(document) => document,
                    Err(e) => {
                        warn!(error = %e, "Skipping line that is not valid JSON");
                        continue;
                    }
                };
                match supervisor.publish(&document).await {
                    Ok(()) => published += 1,
                    Err(e) => warn!(error = %e, "Message dropped"),
                }
            }
            state = supervisor.wait_for_termination() => {
                break match state {
                    SupervisorState::Abandoned(reason) => {
                        Err(format!("broker connection lost: {reason}").into())
                    }
                    _ => Ok(()),
                };
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break Ok(());
            }
        }
    };

    info!(published, "Publishing finished");
    if let Err(e) = supervisor.close().await {
        warn!(error = %e, "Error during shutdown");
    }
    outcome
}

fn handle_config_command(config: &BusConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor_config = config.to_supervisor_config()?;
    let uri = supervisor_config.amqp_uri()?;

    if show {
        let mut masked = config.clone();
        if masked.broker.password.is_some() {
            masked.broker.password = Some("***".to_string());
        }
        println!("{}", toml::to_string_pretty(&masked)?);
        println!(
            "# broker uri: {}",
            wharf_messagebus::supervisor::redact_uri(&uri)
        );
    }

    info!("Configuration validation complete");
    Ok(())
}
