//! rtunnel - expose local services through a relay server
//!
//! Logs in to the relay, keeps the session alive across disconnects and
//! registers the proxies listed in the configuration file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rtunnel_client::config::{AuthMethod, ClientConfig, LogConfig};
use rtunnel_client::{Service, ServiceOptions};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// rtunnel - Reverse tunnel client
#[derive(Parser, Debug)]
#[command(name = "rtunnel")]
#[command(about = "rtunnel - Expose local services through a relay server")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true, env = "RTUNNEL_CONFIG", default_value = "rtunnel.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the relay and keep the configured proxies registered
    Run {
        /// Relay server address, overrides the configuration file
        #[arg(long, env = "RTUNNEL_SERVER_ADDR")]
        server_addr: Option<String>,

        /// Relay server port, overrides the configuration file
        #[arg(long, env = "RTUNNEL_SERVER_PORT")]
        server_port: Option<u16>,

        /// Authentication token, overrides the configuration file
        #[arg(long, env = "RTUNNEL_TOKEN")]
        token: Option<String>,

        /// Time in milliseconds to let work connections drain on shutdown
        #[arg(long, default_value = "500")]
        graceful_close_ms: u64,
    },

    /// Check that the configuration file parses
    Verify,
}

/// Setup logging from the configuration; `RUST_LOG` wins over the file
fn setup_logging(log: &LogConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { log.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if log.to.is_empty() || log.to == "console" {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(!log.disable_print_color),
            )
            .with(filter)
            .init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.to)
            .with_context(|| format!("Failed to open log file {}", log.to))?;
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .with(filter)
            .init();
    }
    Ok(())
}

async fn run(mut config: ClientConfig, verbose: bool, overrides: RunOverrides) -> Result<()> {
    if let Some(addr) = overrides.server_addr {
        config.common.server_addr = addr;
    }
    if let Some(port) = overrides.server_port {
        config.common.server_port = port;
    }
    if let Some(token) = overrides.token {
        config.common.auth.method = AuthMethod::Token;
        config.common.auth.token = token;
    }

    setup_logging(&config.common.log, verbose)?;
    info!(
        "rtunnel {} connecting to {}:{} with {} proxies",
        env!("CARGO_PKG_VERSION"),
        config.common.server_addr,
        config.common.server_port,
        config.proxies.len()
    );

    let svc = Service::new(ServiceOptions::new(config));
    let runner = svc.clone();
    let mut handle = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut handle => {
            return result
                .context("Service task failed")?
                .context("Service stopped with an error");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, draining for {:?}", overrides.graceful_close);
            svc.graceful_close(overrides.graceful_close);
        }
    }

    handle
        .await
        .context("Service task failed")?
        .context("Service stopped with an error")
}

struct RunOverrides {
    server_addr: Option<String>,
    server_port: Option<u16>,
    token: Option<String>,
    graceful_close: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ClientConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let command = cli.command.unwrap_or(Commands::Run {
        server_addr: None,
        server_port: None,
        token: None,
        graceful_close_ms: 500,
    });

    match command {
        Commands::Run {
            server_addr,
            server_port,
            token,
            graceful_close_ms,
        } => {
            let overrides = RunOverrides {
                server_addr,
                server_port,
                token,
                graceful_close: Duration::from_millis(graceful_close_ms),
            };
            if let Err(e) = run(config, cli.verbose, overrides).await {
                error!("{:#}", e);
                return Err(e);
            }
            Ok(())
        }
        Commands::Verify => {
            println!(
                "config file {} syntax is ok ({} proxies, {} visitors)",
                cli.config.display(),
                config.proxies.len(),
                config.visitors.len()
            );
            for proxy in &config.proxies {
                println!(
                    "  {} [{}] -> {}",
                    proxy.name(),
                    proxy.kind(),
                    proxy.base().local_addr()
                );
            }
            Ok(())
        }
    }
}
