//! swgp-relay: simple WireGuard proxy relay
//!
//! Main entry point. Loads the JSON configuration, starts every configured
//! server service, and runs until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! swgp-relay
//!
//! # Run with custom configuration
//! swgp-relay -c /path/to/config.json
//!
//! # Validate a configuration without starting
//! swgp-relay -c /path/to/config.json --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use swgp_relay::config::{load_config, Config};
use swgp_relay::server::Server;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/swgp-relay/config.json");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("swgp-relay v{}", swgp_relay::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"swgp-relay v{}

Simple WireGuard proxy relay.

USAGE:
    swgp-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/swgp-relay/config.json]
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    RUST_LOG                Override log level (trace, debug, info, warn, error)
",
        swgp_relay::VERSION
    );
}

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over the config file's `logLevel`.
fn init_logging(config: &Config) {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("swgp-relay v{}", swgp_relay::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    // Start every configured server service.
    let mut servers: Vec<Arc<Server>> = Vec::with_capacity(config.servers.len());
    for server_config in config.servers {
        let server = Arc::new(Server::new(server_config));
        if let Err(e) = server.start().await {
            error!(server = %server, error = %e, "Failed to start service");
            // Stop the services that already came up before bailing out.
            for started in &servers {
                let _ = started.stop().await;
            }
            return Err(anyhow::anyhow!("Failed to start {}: {}", server, e));
        }
        servers.push(server);
    }

    // Run until a termination signal arrives.
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    for server in &servers {
        if let Err(e) = server.stop().await {
            warn!(server = %server, error = %e, "Error stopping service");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
