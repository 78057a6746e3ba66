//! Pipeproxy - Local IPC Forwarding Proxy
//!
//! Listens on a Unix socket and forwards every accepted client stream to a
//! configured upstream endpoint (Unix socket or TCP address).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipeproxy::{config::ConfigManager, ProxyService, ShutdownCoordinator};

/// CLI arguments for pipeproxy
#[derive(Parser, Debug)]
#[command(name = "pipeproxy")]
#[command(about = "Local inter-process stream forwarding proxy")]
#[command(version)]
#[command(long_about = "
Pipeproxy - Local IPC Forwarding Proxy

Listens on a Unix socket and forwards every accepted client stream to a
configured upstream endpoint (a Unix socket path or a TCP address).

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  PIPEPROXY_LISTEN_PATH     - Listening socket path
  PIPEPROXY_UPSTREAM        - Upstream endpoint (path or host:port)
  PIPEPROXY_MAX_CONNECTIONS - Maximum concurrent connections
  PIPEPROXY_RELAY_TIMEOUT   - Relay timeout (e.g., 5m, 30s)
  PIPEPROXY_LOG_LEVEL       - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Listening socket path (overrides config file)
    #[arg(short, long, help = "Listening socket path")]
    pub listen: Option<PathBuf>,

    /// Upstream endpoint (overrides config file)
    #[arg(short, long, help = "Upstream endpoint (path or host:port)")]
    pub upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Maximum number of concurrent connections
    #[arg(long, help = "Maximum number of concurrent connections")]
    pub max_connections: Option<usize>,

    /// Relay timeout in seconds
    #[arg(long, help = "Relay timeout in seconds")]
    pub timeout: Option<u64>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Initialize tracing
    init_tracing(&args)?;

    info!("Starting pipeproxy v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(
        args.listen.as_deref(),
        args.upstream.as_deref(),
        args.max_connections,
        args.timeout,
    );

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    // If validate-config flag is set, just validate and exit
    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen path: {}", config.server.listen_path.display());
        info!("  Upstream: {}", config.server.upstream);
        info!("  Max connections: {}", config.server.max_connections);
        info!("  Relay timeout: {:?}", config.server.relay_timeout);
        info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
        return Ok(());
    }

    info!("Configuration loaded successfully");
    info!(
        "Forwarding {} -> {}",
        config.server.listen_path.display(),
        config.server.upstream
    );
    info!("Max connections: {}", config.server.max_connections);

    // Create the shutdown coordinator owning the exit signal
    let shutdown_coordinator = ShutdownCoordinator::new();

    // Start the proxy service in a separate task; it holds its own exit
    // subscription and drains when the signal arrives
    let service = ProxyService::new(config, shutdown_coordinator.subscribe());
    let mut server_handle = tokio::spawn(async move { service.run().await });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    tokio::select! {
        // The service stopping on its own means startup failed or the
        // listener broke; nothing is left to drain.
        result = &mut server_handle => {
            return match result {
                Ok(run_result) => run_result.context("Proxy service stopped"),
                Err(e) => Err(e).context("Proxy service task failed"),
            };
        }
        signal_result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
                shutdown_coordinator.trigger();
            }
        }
    }

    // Wait for the service to drain and destroy its instance
    info!("Initiating graceful shutdown...");
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Error during shutdown: {:#}", e),
        Err(e) if !e.is_cancelled() => error!("Proxy service task failed: {}", e),
        Err(_) => {}
    }

    info!("Server shutdown complete");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
