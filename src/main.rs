//! rust-gateway entry point
//!
//! ```bash
//! # Run with a config directory holding gateway.ini, servers.json,
//! # and settings.json
//! rust-gateway --configdir /etc/rust-gateway
//! ```
//!
//! Exit status: 0 on clean shutdown, 1 on bootstrap failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use rust_gateway::app::AppController;
use rust_gateway::config::AppConfig;
use rust_gateway::gateway::Gateway;
use rust_gateway::state::FailureReporter;
use rust_gateway::sticky;

/// Command-line arguments
struct Args {
    /// Configuration directory
    config_dir: PathBuf,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_dir = PathBuf::from(".");

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--configdir" => {
                    if let Some(dir) = args.next() {
                        config_dir = PathBuf::from(dir);
                    } else {
                        eprintln!("--configdir requires a path");
                        std::process::exit(1);
                    }
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("rust-gateway v{}", rust_gateway::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self { config_dir }
    }
}

fn print_help() {
    println!(
        r"rust-gateway v{}

Protocol-sniffing local proxy gateway with encrypted tunnel backends.

USAGE:
    rust-gateway [OPTIONS]

OPTIONS:
    --configdir <PATH>   Configuration directory [default: .]
                         (gateway.ini, servers.json, settings.json)
    -h, --help           Print help information
    -v, --version        Print version information

ENVIRONMENT:
    RUST_LOG             Override log filtering (standard tracing syntax)
    CRYPT_KEY            Override the tunnel cipher key id
",
        rust_gateway::VERSION
    );
}

/// Initialize logging
///
/// Log level priority (highest to lowest):
/// 1. `RUST_LOG` environment variable
/// 2. Config file `log_level` setting
/// 3. Default: "info"
fn init_logging(config: &AppConfig) {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        // Reduce noise from dependencies
        .add_directive("tokio=warn".parse().unwrap())
        .add_directive("rustls=warn".parse().unwrap())
        .add_directive("tungstenite=warn".parse().unwrap());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config_dir)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration from {:?}: {e}", args.config_dir))?;
    init_logging(&config);

    info!("rust-gateway v{}", rust_gateway::VERSION);
    info!(config_dir = %args.config_dir.display(), "Configuration loaded");

    let config = Arc::new(config);
    let controller = AppController::new(Arc::clone(&config), args.config_dir.clone())
        .map_err(|e| anyhow::anyhow!("Controller setup failed: {e}"))?;

    controller
        .bootstrap()
        .await
        .map_err(|e| anyhow::anyhow!("Bootstrap failed: {e}"))?;

    // Background loops: periodic probing and sticky cleanup
    let health_loop = controller.spawn_health_loop();
    let sticky_cleanup = sticky::spawn_cleanup(&controller.dispatcher().sticky());

    // The unified gateway port
    let gateway = if config.unified_port > 0 {
        let reporter: Arc<dyn FailureReporter> = controller.clone() as Arc<dyn FailureReporter>;
        let gateway = Gateway::new(config.unified_port, controller.dispatcher(), reporter);
        gateway
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Gateway failed to start: {e}"))?;
        Some(gateway)
    } else {
        warn!("Gateway is disabled (unified_port = 0)");
        None
    };

    info!("Startup complete");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }

    // Graceful shutdown: stop accepting, then cascade through instances
    if let Some(gateway) = gateway {
        gateway.close();
    }
    controller.shutdown().await;
    health_loop.abort();
    sticky_cleanup.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
